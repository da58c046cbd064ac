//! tacore configuration management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main tacore configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaCoreConfig {
    /// Session manager configuration
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Mailbox transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TaCoreConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Reject values the core cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.manager.max_dump_sessions == 0 {
            return Err(Error::Config(
                "manager.max_dump_sessions must be at least 1".to_string(),
            ));
        }
        if self.transport.max_message_size == 0 {
            return Err(Error::Config(
                "transport.max_message_size must be at least 1".to_string(),
            ));
        }
        if self.transport.poll_retries == 0 {
            return Err(Error::Config(
                "transport.poll_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Session manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Let single-instance TAs run concurrently (disables the single-instance lock)
    pub concurrent_single_instance: bool,

    /// Accept secure-data-path memory references at entry
    pub secure_data_path: bool,

    /// Sessions remembered per context by the stats collector
    pub max_dump_sessions: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            concurrent_single_instance: false,
            secure_data_path: true,
            max_dump_sessions: 16,
        }
    }
}

/// Mailbox transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest message the mailbox SRAM window holds, in bytes
    pub max_message_size: usize,

    /// Receive status polls before giving up
    pub poll_retries: u32,

    /// Delay between receive status polls in milliseconds
    pub poll_interval_ms: u64,

    /// Upper bound on drained messages in `clear_pending` (None = pending count at start)
    pub clear_retries: Option<u32>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: 56,
            poll_retries: 100,
            poll_interval_ms: 10,
            clear_retries: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
