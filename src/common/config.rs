//! Configuration for minilog components

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (this replica's address)
    pub node_id: String,

    /// Log stream handled by this node
    #[serde(default)]
    pub stream_id: u64,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Reconfirmation tuning
    #[serde(default)]
    pub reconfirm: ReconfirmConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Reconfirm coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconfirmConfig {
    /// Resend the prepare round if no majority answered within this window
    #[serde(default = "default_prepare_retry_interval")]
    pub prepare_retry_interval_ms: u64,

    /// Minimum gap between two fetch requests to the same holder
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval_ms: u64,

    /// Upper bound on state transitions taken by a single `step()`
    #[serde(default = "default_max_transitions")]
    pub max_transitions_per_step: usize,

    /// Throttle for the "waiting for slide-out" log line
    #[serde(default = "default_slide_wait_log_interval")]
    pub slide_wait_log_interval_ms: u64,

    /// Tick of the async owner loop
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Give up driving after this long (unbounded if absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converge_timeout_ms: Option<u64>,
}

fn default_prepare_retry_interval() -> u64 {
    2_000
}
fn default_fetch_interval() -> u64 {
    2_000
}
fn default_max_transitions() -> usize {
    16
}
fn default_slide_wait_log_interval() -> u64 {
    5_000
}
fn default_poll_interval() -> u64 {
    10
}

impl Default for ReconfirmConfig {
    fn default() -> Self {
        Self {
            prepare_retry_interval_ms: default_prepare_retry_interval(),
            fetch_interval_ms: default_fetch_interval(),
            max_transitions_per_step: default_max_transitions(),
            slide_wait_log_interval_ms: default_slide_wait_log_interval(),
            poll_interval_ms: default_poll_interval(),
            converge_timeout_ms: None,
        }
    }
}

impl ReconfirmConfig {
    pub fn prepare_retry_interval(&self) -> Duration {
        Duration::from_millis(self.prepare_retry_interval_ms)
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_interval_ms)
    }

    pub fn slide_wait_log_interval(&self) -> Duration {
        Duration::from_millis(self.slide_wait_log_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn converge_timeout(&self) -> Option<Duration> {
        self.converge_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_transitions_per_step == 0 {
            return Err(Error::InvalidConfig(
                "max_transitions_per_step must be at least 1".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "poll_interval_ms must be positive".into(),
            ));
        }
        if self.converge_timeout_ms == Some(0) {
            return Err(Error::InvalidConfig(
                "converge_timeout_ms must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then `MINILOG_*`
    /// environment variables (`MINILOG_RECONFIRM__FETCH_INTERVAL_MS=500`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("node_id", "127.0.0.1:2882")?
            .set_default("stream_id", 1)?
            .set_default("log_level", default_log_level())?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("MINILOG")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(Error::InvalidConfig("node_id cannot be empty".into()));
        }
        self.reconfirm.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_reconfirm_defaults() {
        let config = ReconfirmConfig::default();
        assert_eq!(config.prepare_retry_interval(), Duration::from_secs(2));
        assert_eq!(config.fetch_interval(), Duration::from_secs(2));
        assert_eq!(config.max_transitions_per_step, 16);
        assert!(config.converge_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_reconfirm_validate_rejects_zero_guard() {
        let config = ReconfirmConfig {
            max_transitions_per_step: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = ReconfirmConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
node_id = "10.0.0.1:2882"
stream_id = 1001

[reconfirm]
fetch_interval_ms = 250
converge_timeout_ms = 30000
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.node_id, "10.0.0.1:2882");
        assert_eq!(config.stream_id, 1001);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.reconfirm.fetch_interval_ms, 250);
        assert_eq!(config.reconfirm.prepare_retry_interval_ms, 2_000);
        assert_eq!(
            config.reconfirm.converge_timeout(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
node_id = "10.0.0.1:2882"

[reconfirm]
max_transitions_per_step = 0
"#
        )
        .unwrap();

        assert!(Config::load(Some(file.path())).is_err());
    }
}
