//! Daemon configuration.
//!
//! Tunables the spec leaves open (worker budget, per-address timeouts,
//! channel capacities, terminal-record retention) live here with documented
//! defaults rather than hard-coded constants. Loaded from an optional TOML
//! file; every field falls back to its default when absent.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// Default number of concurrent probe workers per scan phase.
///
/// Deliberately smaller than a /24 range so a scan cannot saturate the
/// local link.
pub const DEFAULT_WORKER_BUDGET: usize = 32;

/// Default per-address liveness probe timeout.
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 750;

/// Default per-address identification timeout.
pub const DEFAULT_IDENTIFY_TIMEOUT_MS: u64 = 1_500;

/// Default discovery event channel capacity.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Default grace added on top of a stage's expected duration before the
/// executor gives up on it.
pub const DEFAULT_STAGE_GRACE_MS: u64 = 5_000;

/// Default number of terminal execution records retained for polling.
pub const DEFAULT_TERMINAL_RETENTION: usize = 64;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {message}")]
    Io { path: String, message: String },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config {path}: {message}")]
    Parse { path: String, message: String },
}

/// Discovery engine tunables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Concurrent probe workers per phase.
    pub worker_budget: usize,
    /// Per-address liveness probe timeout, in milliseconds.
    pub probe_timeout_ms: u64,
    /// Per-address identification timeout, in milliseconds.
    pub identify_timeout_ms: u64,
    /// Capacity of the scan's event channel.
    pub event_buffer: usize,
}

impl DiscoverySettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn identify_timeout(&self) -> Duration {
        Duration::from_millis(self.identify_timeout_ms)
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            worker_budget: DEFAULT_WORKER_BUDGET,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            identify_timeout_ms: DEFAULT_IDENTIFY_TIMEOUT_MS,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// Action executor tunables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Grace added to a stage's expected duration before timing it out,
    /// in milliseconds.
    pub stage_grace_ms: u64,
    /// How many terminal execution records to retain for later polling.
    pub terminal_retention: usize,
}

impl ExecutorSettings {
    pub fn stage_grace(&self) -> Duration {
        Duration::from_millis(self.stage_grace_ms)
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            stage_grace_ms: DEFAULT_STAGE_GRACE_MS,
            terminal_retention: DEFAULT_TERMINAL_RETENTION,
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub discovery: DiscoverySettings,
    pub executor: ExecutorSettings,
}

impl HubConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// `ConfigError::Io` if the file cannot be read, `ConfigError::Parse`
    /// if it is not valid TOML for this schema.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Loads from `path` when given, otherwise returns defaults.
    ///
    /// A missing or unreadable file falls back to defaults with a warning;
    /// a file that exists but fails to parse is a hard error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            None => Ok(Self::default()),
            Some(p) if !p.exists() => {
                warn!(path = %p.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Some(p) => Self::load(p),
        }
    }
}
