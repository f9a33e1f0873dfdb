//! Runtime configuration for the dispatch core.
//!
//! Every field has a default, so a missing or partial `config.json` is fine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// Largest accepted import file, matching the 500 KB ceiling of the upload form.
pub const DEFAULT_MAX_IMPORT_BYTES: usize = 500 * 1024;

/// Tunables shared by the importer, validator and dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    /// Files larger than this are rejected before parsing.
    pub max_import_bytes: usize,
    /// Cap on error strings returned from one bulk operation.
    pub max_reported_errors: usize,
    /// Simultaneous validation handshakes.
    pub validation_concurrency: usize,
    /// Deadline for one validation handshake, in seconds.
    pub validation_timeout_secs: u64,
    /// Deadline for one send attempt, in seconds.
    pub send_timeout_secs: u64,
    /// Simultaneous sends across all relays.
    pub max_workers: usize,
    /// Simultaneous sends through a single relay.
    pub per_relay_concurrency: usize,
    /// Daily quota given to imported relays; `None` disables enforcement.
    pub default_daily_quota: Option<u32>,
    /// Name announced in EHLO.
    pub helo_name: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_import_bytes: DEFAULT_MAX_IMPORT_BYTES,
            max_reported_errors: 100,
            validation_concurrency: 5,
            validation_timeout_secs: 30,
            send_timeout_secs: 60,
            max_workers: 16,
            per_relay_concurrency: 1,
            default_daily_quota: Some(500),
            helo_name: "localhost".to_string(),
        }
    }
}

impl CoreConfig {
    /// Loads the configuration from a JSON file, or defaults if it is absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if a value is out of range.
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let contents = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&contents)?;
        config.check()?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Rejects values that would stall the core.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn check(&self) -> Result<()> {
        let zero = [
            ("validationConcurrency", self.validation_concurrency),
            ("maxWorkers", self.max_workers),
            ("perRelayConcurrency", self.per_relay_concurrency),
            ("maxImportBytes", self.max_import_bytes),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);

        if let Some((field, _)) = zero {
            return Err(Error::Config(format!("{field} must be at least 1")));
        }
        let zero_timeout = [
            ("validationTimeoutSecs", self.validation_timeout_secs),
            ("sendTimeoutSecs", self.send_timeout_secs),
        ]
        .into_iter()
        .find(|(_, secs)| *secs == 0);
        if let Some((field, _)) = zero_timeout {
            return Err(Error::Config(format!("{field} must be at least 1 second")));
        }
        if self.helo_name.trim().is_empty() {
            return Err(Error::Config("heloName must not be empty".into()));
        }
        Ok(())
    }

    /// Deadline for one validation handshake.
    #[must_use]
    pub const fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }

    /// Deadline for one send attempt.
    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_check() {
        let config = CoreConfig::default();
        assert!(config.check().is_ok());
        assert_eq!(config.max_import_bytes, 512_000);
        assert_eq!(config.validation_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: CoreConfig =
            serde_json::from_str(r#"{"maxWorkers": 4, "defaultDailyQuota": null}"#).unwrap();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.default_daily_quota, None);
        assert_eq!(config.validation_concurrency, 5);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = CoreConfig {
            validation_concurrency: 0,
            ..CoreConfig::default()
        };
        let err = config.check().unwrap_err();
        assert!(err.to_string().contains("validationConcurrency"));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let config = CoreConfig {
            send_timeout_secs: 0,
            ..CoreConfig::default()
        };
        assert!(config.check().unwrap_err().to_string().contains("sendTimeoutSecs"));

        let config: CoreConfig = serde_json::from_str(r#"{"validationTimeoutSecs": 0}"#).unwrap();
        assert!(config.check().unwrap_err().to_string().contains("validationTimeoutSecs"));
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("relaydesk-config-does-not-exist.json");
        let config = CoreConfig::load(&path).await.unwrap();
        assert_eq!(config, CoreConfig::default());
    }
}
