//! Configuration management for portrack.
//!
//! This module defines the structure of the `portrack.toml` configuration file,
//! provides functionality to load and parse it, and resolves the effective
//! [`Settings`] the supervisor and registry are built from.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default ring buffer capacity per managed process.
pub const DEFAULT_MAX_LINES: usize = 500;
/// Default grace window between the termination request and the forced kill.
pub const DEFAULT_STOP_GRACE_MS: u64 = 5_000;
/// Default queue depth for channel subscribers.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

const DATA_DIR_ENV: &str = "PORTRACK_DATA_DIR";
const DEFAULT_CONFIG_FILE: &str = "portrack.toml";

/// Top-level configuration structure corresponding to `portrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Directory holding the allocation and project documents.
    pub data_dir: Option<PathBuf>,
    /// Maximum number of lines to keep in memory per process.
    pub max_lines: Option<usize>,
    /// Grace window in milliseconds before a stop escalates to a forced kill.
    pub stop_grace_ms: Option<u64>,
    /// Whether to strip ANSI escape codes from captured output (default: true).
    pub strip_ansi: Option<bool>,
    /// Queue depth for bounded log subscribers.
    pub channel_capacity: Option<usize>,
}

/// Effective settings after merging defaults, the config file and CLI flags.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub max_lines: usize,
    pub stop_grace: Duration,
    pub strip_ansi: bool,
    pub channel_capacity: usize,
}

impl Settings {
    pub fn allocations_path(&self) -> PathBuf {
        self.data_dir.join("port_allocations.json")
    }

    pub fn projects_path(&self) -> PathBuf {
        self.data_dir.join("projects.json")
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl Settings {
    /// Resolves settings from a parsed config, falling back to defaults.
    pub fn from_config(config: &Config) -> Self {
        let data_dir = config
            .data_dir
            .clone()
            .or_else(|| std::env::var_os(DATA_DIR_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(".portrack"));
        Self {
            data_dir,
            max_lines: config.max_lines.unwrap_or(DEFAULT_MAX_LINES).max(1),
            stop_grace: Duration::from_millis(
                config.stop_grace_ms.unwrap_or(DEFAULT_STOP_GRACE_MS),
            ),
            strip_ansi: config.strip_ansi.unwrap_or(true),
            channel_capacity: config
                .channel_capacity
                .unwrap_or(DEFAULT_CHANNEL_CAPACITY)
                .max(1),
        }
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Picks the config to use: an explicit path, else `./portrack.toml` when present.
pub fn discover_config(explicit: Option<&Path>, no_config: bool) -> Result<Config> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    if no_config {
        return Ok(Config::default());
    }
    let local = Path::new(DEFAULT_CONFIG_FILE);
    if local.is_file() {
        return load_config(local);
    }
    Ok(Config::default())
}
