//! Worker settings from environment variables.

use std::str::FromStr;
use std::time::Duration;

use optti_client::ClientConfig;
use optti_client::client::{DEFAULT_BACKEND_URL, DEFAULT_MAX_RETRIES};
use optti_queue::RunnerConfig;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a positive integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
}

/// Everything the worker binary needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub backend_url: String,
    pub site_url: String,
    pub database_url: String,
    pub plugin_slug: String,
    /// Key material for encrypting stored credentials
    pub auth_salt: Option<String>,
    pub license_key: Option<String>,
    pub auth_token: Option<String>,
    pub max_retries: u32,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub stale_timeout: Duration,
    pub sweep_interval: Duration,
    /// `{site_url}` and `{id}` are substituted
    pub image_url_template: String,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from any variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let auth_salt = get("OPTTI_AUTH_SALT");
        if auth_salt.is_none() {
            tracing::warn!(
                source = "worker",
                "OPTTI_AUTH_SALT not set; credentials are stored unencrypted"
            );
        }

        Ok(Self {
            backend_url: get("OPTTI_BACKEND_URL")
                .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
            site_url: get("OPTTI_SITE_URL").unwrap_or_else(|| "http://localhost".to_string()),
            database_url: get("OPTTI_DATABASE_URL")
                .unwrap_or_else(|| "sqlite://optti.db?mode=rwc".to_string()),
            plugin_slug: get("OPTTI_PLUGIN_SLUG").unwrap_or_else(|| "optti".to_string()),
            auth_salt,
            license_key: get("OPTTI_LICENSE_KEY"),
            auth_token: get("OPTTI_AUTH_TOKEN"),
            max_retries: number(&get, "OPTTI_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            batch_size: number(&get, "OPTTI_BATCH_SIZE", 5)?,
            max_attempts: number(&get, "OPTTI_MAX_ATTEMPTS", 3)?,
            stale_timeout: Duration::from_secs(number(&get, "OPTTI_STALE_TIMEOUT_SECS", 600)?),
            sweep_interval: Duration::from_secs(number(&get, "OPTTI_SWEEP_INTERVAL_SECS", 60)?),
            image_url_template: get("OPTTI_IMAGE_URL_TEMPLATE")
                .unwrap_or_else(|| "{site_url}/?attachment_id={id}".to_string()),
        })
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::default()
            .with_base_url(self.backend_url.clone())
            .with_site_url(self.site_url.clone())
            .with_max_retries(self.max_retries)
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig::default()
            .with_name(format!("{}-worker", self.plugin_slug))
            .with_batch_size(self.batch_size)
            .with_max_attempts(self.max_attempts)
            .with_stale_timeout(self.stale_timeout)
    }
}

fn number<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(value) => match value.parse::<T>() {
            Ok(parsed) if parsed > T::default() => Ok(parsed),
            _ => Err(ConfigError::InvalidNumber { name, value }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let settings = settings(&[]).unwrap();
        assert_eq!(settings.backend_url, DEFAULT_BACKEND_URL);
        assert_eq!(settings.plugin_slug, "optti");
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.batch_size, 5);
        assert_eq!(settings.stale_timeout, Duration::from_secs(600));
        assert_eq!(settings.auth_salt, None);
    }

    #[test]
    fn values_are_read_and_trimmed() {
        let settings = settings(&[
            ("OPTTI_BACKEND_URL", "https://api.test/"),
            ("OPTTI_PLUGIN_SLUG", " beepbeep-ai "),
            ("OPTTI_BATCH_SIZE", "10"),
            ("OPTTI_LICENSE_KEY", ""),
        ])
        .unwrap();
        assert_eq!(settings.plugin_slug, "beepbeep-ai");
        assert_eq!(settings.batch_size, 10);
        assert_eq!(settings.license_key, None);
        assert_eq!(settings.client_config().base_url, "https://api.test");
        assert_eq!(settings.runner_config().batch_size, 10);
        assert_eq!(settings.runner_config().name, "beepbeep-ai-worker");
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        assert_eq!(
            settings(&[("OPTTI_MAX_RETRIES", "three")]),
            Err(ConfigError::InvalidNumber {
                name: "OPTTI_MAX_RETRIES",
                value: "three".into()
            })
        );
        assert!(settings(&[("OPTTI_BATCH_SIZE", "0")]).is_err());
    }
}
