//! Per-plugin queue namespace.

use optti_core::sanitize_key;

const DEFAULT_SLUG: &str = "optti";

/// Identifies one queue: its table and its trigger hook.
///
/// Several plugins can share a database, each with its own namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueNamespace {
    slug: String,
}

impl QueueNamespace {
    /// Sanitises `slug`; an empty result falls back to `optti`.
    pub fn new(slug: &str) -> Self {
        let slug = sanitize_key(slug);
        if slug.is_empty() {
            Self {
                slug: DEFAULT_SLUG.to_string(),
            }
        } else {
            Self { slug }
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// Table holding this queue's jobs. Only `[a-z0-9_]`, safe to interpolate.
    pub fn table_name(&self) -> String {
        format!("optti_queue_{}", self.slug.replace('-', "_"))
    }

    /// Trigger identifier armed on the deferred scheduler.
    pub fn hook_name(&self) -> String {
        format!("optti_process_queue_{}", self.slug)
    }
}

impl Default for QueueNamespace {
    fn default() -> Self {
        Self::new(DEFAULT_SLUG)
    }
}

impl std::fmt::Display for QueueNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.slug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_table_and_hook_names() {
        let ns = QueueNamespace::new("BeepBeep-AI");
        assert_eq!(ns.slug(), "beepbeep-ai");
        assert_eq!(ns.table_name(), "optti_queue_beepbeep_ai");
        assert_eq!(ns.hook_name(), "optti_process_queue_beepbeep-ai");
    }

    #[test]
    fn empty_slug_falls_back_to_default() {
        assert_eq!(QueueNamespace::new("  !! ").slug(), "optti");
        assert_eq!(QueueNamespace::default().table_name(), "optti_queue_optti");
    }
}
