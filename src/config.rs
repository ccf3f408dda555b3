// Process configuration, read from the environment after `.env` is loaded.

use anyhow::{bail, Context};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database_file: String,
    pub tick_interval: Duration,
    pub publish_timeout: Duration,
    pub reply_timeout: Duration,
    /// How long shutdown waits for delayed replies and publish runs.
    pub shutdown_grace: Duration,
    pub generation_url: String,
    pub generation_api_key: Option<String>,
    pub reply_gateway_url: String,
    pub publish_gateway_url: String,
    pub ops_webhook_url: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| {
            optional(key).with_context(|| format!("{key} must be set in the environment"))
        };
        let seconds = |key: &str, default: u64| -> anyhow::Result<Duration> {
            let secs = match optional(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("{key} must be a whole number of seconds, got '{raw}'"))?,
                None => default,
            };
            if secs == 0 {
                bail!("{key} must be greater than zero");
            }
            Ok(Duration::from_secs(secs))
        };

        Ok(Self {
            data_dir: PathBuf::from(optional("DATA_DIR").unwrap_or_else(|| "data".to_string())),
            database_file: optional("DATABASE_FILE").unwrap_or_else(|| "marketing.db".to_string()),
            tick_interval: seconds("TICK_INTERVAL_SECS", 60)?,
            publish_timeout: seconds("PUBLISH_TIMEOUT_SECS", 30)?,
            reply_timeout: seconds("REPLY_TIMEOUT_SECS", 15)?,
            shutdown_grace: seconds("SHUTDOWN_GRACE_SECS", 120)?,
            generation_url: required("GENERATION_URL")?,
            generation_api_key: optional("GENERATION_API_KEY"),
            reply_gateway_url: required("REPLY_GATEWAY_URL")?,
            publish_gateway_url: required("PUBLISH_GATEWAY_URL")?,
            ops_webhook_url: optional("OPS_WEBHOOK_URL"),
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    const ENDPOINTS: [(&str, &str); 3] = [
        ("GENERATION_URL", "http://kb.local/generate"),
        ("REPLY_GATEWAY_URL", "http://channels.local/reply"),
        ("PUBLISH_GATEWAY_URL", "http://publish.local"),
    ];

    #[test]
    fn defaults_apply_when_only_endpoints_are_set() {
        let config = AppConfig::from_lookup(lookup(&ENDPOINTS)).unwrap();

        assert_eq!(config.database_path(), PathBuf::from("data/marketing.db"));
        assert_eq!(config.tick_interval, Duration::from_secs(60));
        assert_eq!(config.publish_timeout, Duration::from_secs(30));
        assert_eq!(config.reply_timeout, Duration::from_secs(15));
        assert_eq!(config.shutdown_grace, Duration::from_secs(120));
        assert_eq!(config.ops_webhook_url, None);
    }

    #[test]
    fn missing_endpoint_is_named() {
        let err = AppConfig::from_lookup(lookup(&ENDPOINTS[..2])).unwrap_err();
        assert!(err.to_string().contains("PUBLISH_GATEWAY_URL"));
    }

    #[test]
    fn zero_or_garbage_timeouts_are_rejected() {
        let mut vars = ENDPOINTS.to_vec();
        vars.push(("PUBLISH_TIMEOUT_SECS", "0"));
        assert!(AppConfig::from_lookup(lookup(&vars)).is_err());

        let mut vars = ENDPOINTS.to_vec();
        vars.push(("TICK_INTERVAL_SECS", "soon"));
        let err = AppConfig::from_lookup(lookup(&vars)).unwrap_err();
        assert!(err.to_string().contains("TICK_INTERVAL_SECS"));
    }

    #[test]
    fn blank_optional_values_count_as_unset() {
        let mut vars = ENDPOINTS.to_vec();
        vars.push(("OPS_WEBHOOK_URL", "  "));
        vars.push(("GENERATION_API_KEY", "sk-test"));

        let config = AppConfig::from_lookup(lookup(&vars)).unwrap();

        assert_eq!(config.ops_webhook_url, None);
        assert_eq!(config.generation_api_key.as_deref(), Some("sk-test"));
    }
}
