//! Configuration management for the OMEMO engine.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::crypto::{MIN_PREKEY_COUNT, RECOMMENDED_PREKEY_COUNT};
use crate::device::{DeviceId, Jid};
use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "omemo.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "OMEMO";

/// Complete configuration for an engine instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Local account configuration
    pub account: AccountConfig,
    /// Bundle publishing and validation
    pub bundle: BundleConfig,
    /// Transport and queue tuning
    pub transport: TransportConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Local account configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Account address, bare or full
    pub jid: String,
    /// Fixed device id; a random one is generated when absent
    pub device_id: Option<u32>,
}

/// Bundle publishing and validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleConfig {
    /// Number of one-time prekeys kept in the published bundle
    pub prekey_count: usize,
    /// Bundles with fewer prekeys are rejected
    pub min_prekey_count: usize,
    /// Verify the signed prekey signature against the identity key
    pub verify_signatures: bool,
}

/// Transport and queue tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Seconds before an outstanding bundle fetch resolves as timed out
    pub fetch_timeout_secs: u64,
    /// Artificial delivery latency of the in-memory network
    pub latency_ms: u64,
    /// Capacity of the engine's command queue
    pub queue_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            jid: "user@localhost".to_string(),
            device_id: None,
        }
    }
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            prekey_count: RECOMMENDED_PREKEY_COUNT,
            min_prekey_count: MIN_PREKEY_COUNT,
            verify_signatures: false,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: crate::defaults::DEFAULT_FETCH_TIMEOUT,
            latency_ms: 0,
            queue_capacity: crate::defaults::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl TransportConfig {
    /// Fetch timeout as a duration
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Delivery latency as a duration
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            if path.exists() {
                config = config.merge(Self::from_file(path)?);
            } else {
                return Err(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
                .into());
            }
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("omemo-engine")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            for location in &default_locations {
                if location.exists() {
                    config = config.merge(Self::from_file(location)?);
                    break;
                }
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Merge this configuration with another, preferring values from other
    pub fn merge(mut self, other: Self) -> Self {
        self.account = other.account;
        self.bundle = other.bundle;
        self.transport = other.transport;
        self.logging = other.logging;
        self
    }

    fn merge_from_env(mut self) -> Result<Self> {
        if let Ok(jid) = std::env::var("OMEMO_ACCOUNT_JID") {
            self.account.jid = jid;
        }

        if let Ok(level) = std::env::var("OMEMO_LOGGING_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(timeout) = std::env::var("OMEMO_TRANSPORT_FETCH_TIMEOUT_SECS") {
            self.transport.fetch_timeout_secs =
                timeout.parse().map_err(|_| ConfigError::InvalidValue {
                    field: "OMEMO_TRANSPORT_FETCH_TIMEOUT_SECS".to_string(),
                    value: timeout,
                })?;
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if Jid::parse(&self.account.jid).is_err() {
            return Err(invalid("account.jid", &self.account.jid));
        }

        if let Some(device_id) = self.account.device_id {
            if DeviceId::new(device_id).is_err() {
                return Err(invalid("account.device_id", device_id));
            }
        }

        // The protocol floor cannot be lowered by configuration.
        if self.bundle.min_prekey_count < MIN_PREKEY_COUNT {
            return Err(invalid("bundle.min_prekey_count", self.bundle.min_prekey_count));
        }

        if self.bundle.prekey_count < self.bundle.min_prekey_count {
            return Err(invalid("bundle.prekey_count", self.bundle.prekey_count));
        }

        if self.transport.fetch_timeout_secs == 0 {
            return Err(invalid("transport.fetch_timeout_secs", 0));
        }

        if self.transport.queue_capacity == 0 {
            return Err(invalid("transport.queue_capacity", 0));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(invalid("logging.level", &self.logging.level)),
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn invalid(field: &str, value: impl ToString) -> crate::utils::OmemoError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}
