//! Deferred, idempotent one-shot triggers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;

/// Arranges for a named hook to fire once after a delay.
pub trait DeferredScheduler: Send + Sync {
    /// Arm `hook` to fire after `delay`.
    ///
    /// No-op returning `false` when `hook` is already armed.
    fn schedule_once(&self, delay: Duration, hook: &str) -> bool;

    fn is_scheduled(&self, hook: &str) -> bool;
}

impl<D: DeferredScheduler + ?Sized> DeferredScheduler for Arc<D> {
    fn schedule_once(&self, delay: Duration, hook: &str) -> bool {
        (**self).schedule_once(delay, hook)
    }

    fn is_scheduled(&self, hook: &str) -> bool {
        (**self).is_scheduled(hook)
    }
}

/// Scheduler backed by tokio timers.
///
/// When a hook fires it is disarmed first, then its name is sent on the
/// channel returned by [`TokioScheduler::new`]. Must be used from within a
/// tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    armed: Arc<Mutex<HashSet<String>>>,
    fired: mpsc::UnboundedSender<String>,
}

impl TokioScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (fired, triggers) = mpsc::unbounded_channel();
        (
            Self {
                armed: Arc::new(Mutex::new(HashSet::new())),
                fired,
            },
            triggers,
        )
    }
}

fn armed_set(armed: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    // The set stays consistent even if a holder panicked.
    armed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DeferredScheduler for TokioScheduler {
    fn schedule_once(&self, delay: Duration, hook: &str) -> bool {
        if !armed_set(&self.armed).insert(hook.to_string()) {
            return false;
        }

        let armed = Arc::clone(&self.armed);
        let fired = self.fired.clone();
        let hook = hook.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            armed_set(&armed).remove(&hook);
            if fired.send(hook.clone()).is_err() {
                tracing::debug!(hook = %hook, "trigger fired with no listener");
            }
        });
        true
    }

    fn is_scheduled(&self, hook: &str) -> bool {
        armed_set(&self.armed).contains(hook)
    }
}
