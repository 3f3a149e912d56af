//! Runtime configuration
//!
//! Every section has defaults, so an empty JSON object is a valid config.
//! `SECURE_SESSION_DATABASE` and `SECURE_SESSION_DIRECTORY_URL` override the
//! file values.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};

pub const DATABASE_ENV: &str = "SECURE_SESSION_DATABASE";
pub const DIRECTORY_URL_ENV: &str = "SECURE_SESSION_DIRECTORY_URL";

/// Configuration for pre-key management
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreKeyConfig {
    /// Number of one-time pre-keys generated at bootstrap
    pub initial_batch_size: u32,
    /// Number of one-time pre-keys generated when replenishing
    pub replenishment_batch_size: u32,
    /// Minimum number of pre-keys before replenishment is due
    pub min_pre_key_count: u32,
    /// Maximum age of the signed pre-key in days before rotation is due
    pub signed_pre_key_max_age_days: i64,
}

impl Default for PreKeyConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: 100,
            replenishment_batch_size: 100,
            min_pre_key_count: 25,
            signed_pre_key_max_age_days: 7,
        }
    }
}

/// Receiving-chain limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How far ahead of the receiving chain a counter may be
    pub max_skip: u32,
    /// Skipped message keys kept per session; oldest are evicted first
    pub max_skipped_keys: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_skip: 1000,
            max_skipped_keys: 2000,
        }
    }
}

/// Connection and reconnection behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub auto_reconnect: bool,
    /// Capacity of the inbound and outbound channels
    pub channel_capacity: usize,
}

impl TransportConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            auto_reconnect: true,
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pre_keys: PreKeyConfig,
    pub session: SessionConfig,
    pub transport: TransportConfig,
    /// Trust failures tolerated per peer before negotiation is blocked
    pub quarantine_threshold: u32,
    /// Base URL of the HTTP key directory
    pub directory_url: Option<String>,
    /// SQLite database path; in-memory store when unset
    pub database_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pre_keys: PreKeyConfig::default(),
            session: SessionConfig::default(),
            transport: TransportConfig::default(),
            quarantine_threshold: 3,
            directory_url: None,
            database_path: None,
        }
    }
}

impl Config {
    /// Load from a JSON file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("{}: {}", path.display(), e)))?;
        let mut config = Self::from_json(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> SessionResult<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> SessionResult<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| SessionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var(DATABASE_ENV) {
            self.database_path = Some(path);
        }
        if let Ok(url) = std::env::var(DIRECTORY_URL_ENV) {
            self.directory_url = Some(url);
        }
    }

    pub fn validate(&self) -> SessionResult<()> {
        if self.transport.max_attempts == 0 {
            return Err(SessionError::Config("transport.max_attempts must be at least 1".to_string()));
        }
        if self.transport.channel_capacity == 0 {
            return Err(SessionError::Config("transport.channel_capacity must be at least 1".to_string()));
        }
        if self.quarantine_threshold == 0 {
            return Err(SessionError::Config("quarantine_threshold must be at least 1".to_string()));
        }
        if let Some(url) = &self.directory_url {
            url::Url::parse(url).map_err(|e| SessionError::Config(format!("directory_url: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.pre_keys.initial_batch_size, 100);
        assert_eq!(config.pre_keys.min_pre_key_count, 25);
        assert_eq!(config.session.max_skip, 1000);
        assert_eq!(config.transport.max_attempts, 5);
        assert_eq!(config.quarantine_threshold, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = Config::from_json(r#"{"session": {"max_skip": 10}, "quarantine_threshold": 5}"#).unwrap();
        assert_eq!(config.session.max_skip, 10);
        assert_eq!(config.session.max_skipped_keys, 2000);
        assert_eq!(config.quarantine_threshold, 5);
        assert_eq!(config.transport, TransportConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            Config::from_json(r#"{"transport": {"max_attempts": 0}}"#),
            Err(SessionError::Config(_))
        ));
        assert!(matches!(
            Config::from_json(r#"{"directory_url": "not a url"}"#),
            Err(SessionError::Config(_))
        ));
        assert!(matches!(Config::from_json("[1, 2]"), Err(SessionError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"pre_keys": {"initial_batch_size": 10}}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.pre_keys.initial_batch_size, 10);

        assert!(Config::load(dir.path().join("missing.json")).is_err());
    }
}
