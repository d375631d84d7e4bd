//! Exerciser configuration
//!
//! Loaded from the TOML file named by `COMMANDER_CONFIG`; every key is
//! optional and falls back to the protocol defaults.

use anyhow::{Context, Result};
use commander_shared::defaults;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::connection::ConnectionConfig;
use crate::exerciser::Pacing;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "COMMANDER_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CommanderConfig {
    pub tenant_id: String,
    pub device_id: String,
    /// Device endpoint address (host:port)
    pub server_addr: String,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Initial delay before a reconnect attempt, doubled on every failure
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub worker_pool_size: usize,
    pub pacing: PacingConfig,
    pub command: CommandTemplate,
}

impl Default for CommanderConfig {
    fn default() -> Self {
        Self {
            tenant_id: defaults::TENANT_ID.into(),
            device_id: defaults::DEVICE_ID.into(),
            server_addr: defaults::SERVER_ADDR.into(),
            request_timeout_ms: defaults::REQUEST_TIMEOUT_MS,
            connect_timeout_ms: 5000,
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30_000,
            worker_pool_size: defaults::WORKER_POOL_SIZE,
            pacing: PacingConfig::default(),
            command: CommandTemplate::default(),
        }
    }
}

/// The synthetic command fired every cycle
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CommandTemplate {
    /// Raw command name; an `ow:` prefix makes it one-way
    pub name: String,
    pub payload: String,
    pub content_type: String,
}

impl Default for CommandTemplate {
    fn default() -> Self {
        Self {
            name: "MQTTTestCommand".into(),
            payload: r#"{"temperature":21}"#.into(),
            content_type: "application/json".into(),
        }
    }
}

/// Delay strategy between cycles
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum PacingConfig {
    /// Start the next cycle as soon as the previous one is handled
    #[default]
    Immediate,
    Fixed {
        #[serde(rename = "interval-ms")]
        interval_ms: u64,
    },
    /// Exponential delay after failures, reset by a success
    Backoff {
        #[serde(rename = "initial-ms")]
        initial_ms: u64,
        #[serde(rename = "max-ms")]
        max_ms: u64,
    },
}

impl CommanderConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load from `COMMANDER_CONFIG` if set, otherwise use defaults
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            server_addr: self.server_addr.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_reconnect_delay: Duration::from_millis(self.max_reconnect_delay_ms),
        }
    }

    pub fn pacing(&self) -> Pacing {
        match self.pacing {
            PacingConfig::Immediate => Pacing::immediate(),
            PacingConfig::Fixed { interval_ms } => Pacing::fixed(Duration::from_millis(interval_ms)),
            PacingConfig::Backoff { initial_ms, max_ms } => Pacing::backoff(
                Duration::from_millis(initial_ms),
                Duration::from_millis(max_ms),
            ),
        }
    }
}
