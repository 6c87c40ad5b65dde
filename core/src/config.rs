//! Runtime configuration.
//!
//! Loaded from TOML, every section optional:
//!
//! ```toml
//! [instance]
//! max_index_skew = 1024
//! strict_inputs = true
//!
//! [provenance]
//! history_memo_limit = 100
//!
//! [subscriptions]
//! max_pending_per_tool = 64
//!
//! [logging]
//! filter = "blockflow=debug"
//! json = false
//! ```
//!
//! `BLOCKFLOW_*` environment variables override file values, see
//! [`RuntimeConfig::with_env_overrides`].

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub(crate) type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub instance: InstanceConfig,
    pub provenance: ProvenanceConfig,
    pub subscriptions: SubscriptionConfig,
    pub logging: LoggingConfig,
}

/// Slot table behaviour of live instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Largest gap allowed between the current length of a List port or pin
    /// and the index being written. Gaps are padded with nulls.
    pub max_index_skew: usize,
    /// Reject inputs addressed to undeclared ports or pins.
    pub strict_inputs: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            max_index_skew: 1024,
            strict_inputs: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvenanceConfig {
    /// Memoised version histories kept before the oldest half is dropped.
    pub history_memo_limit: usize,
}

impl Default for ProvenanceConfig {
    fn default() -> Self {
        Self {
            history_memo_limit: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Outstanding tool calls allowed per tool port. Unbounded when unset.
    pub max_pending_per_tool: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Apply `BLOCKFLOW_MAX_INDEX_SKEW`, `BLOCKFLOW_STRICT_INPUTS`,
    /// `BLOCKFLOW_HISTORY_MEMO_LIMIT`, `BLOCKFLOW_MAX_PENDING_PER_TOOL`,
    /// `BLOCKFLOW_LOG` and `BLOCKFLOW_LOG_FORMAT` (`json` or `text`).
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::with_env_overrides`] with a custom variable source.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(value) = lookup("BLOCKFLOW_MAX_INDEX_SKEW") {
            self.instance.max_index_skew = parse("BLOCKFLOW_MAX_INDEX_SKEW", &value)?;
        }
        if let Some(value) = lookup("BLOCKFLOW_STRICT_INPUTS") {
            self.instance.strict_inputs = parse_flag("BLOCKFLOW_STRICT_INPUTS", &value)?;
        }
        if let Some(value) = lookup("BLOCKFLOW_HISTORY_MEMO_LIMIT") {
            self.provenance.history_memo_limit = parse("BLOCKFLOW_HISTORY_MEMO_LIMIT", &value)?;
        }
        if let Some(value) = lookup("BLOCKFLOW_MAX_PENDING_PER_TOOL") {
            self.subscriptions.max_pending_per_tool = match value.trim() {
                "" | "none" | "unbounded" => None,
                raw => Some(parse("BLOCKFLOW_MAX_PENDING_PER_TOOL", raw)?),
            };
        }
        if let Some(value) = lookup("BLOCKFLOW_LOG") {
            self.logging.filter = value;
        }
        if let Some(value) = lookup("BLOCKFLOW_LOG_FORMAT") {
            self.logging.json = match value.to_ascii_lowercase().as_str() {
                "json" => true,
                "text" | "pretty" | "compact" => false,
                _ => return Err(invalid("BLOCKFLOW_LOG_FORMAT", &value)),
            };
        }
        Ok(self)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidOverride {
        key: key.to_string(),
        value: value.to_string(),
    }
}
