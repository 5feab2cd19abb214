//! Bootstrap configuration loading and config file resolution
//!
//! Settings come from a single TOML file. Every field has a built-in default,
//! so a missing file (or a missing section) never prevents startup.
//!
//! Config file resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. `MPIPE_CONFIG` environment variable
//! 3. Platform config directory (`<config_dir>/mpipe/config.toml`)
//! 4. Compiled defaults (fallback)

use crate::{Error, Mtime, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "MPIPE_CONFIG";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct TomlConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub mux: MuxConfig,

    #[serde(default)]
    pub decoder: DecoderConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Default bounds for block queues created by the pipeline
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum pending blocks (unbounded if absent)
    #[serde(default)]
    pub max_blocks: Option<usize>,

    /// Maximum pending payload bytes (unbounded if absent)
    #[serde(default)]
    pub max_bytes: Option<usize>,
}

/// Default bound on the wait-for-first-block gate (1.5s of queued media)
pub const DEFAULT_ADD_STREAM_WAIT_US: Mtime = 1_500_000;

/// Muxer policy settings
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct MuxConfig {
    /// Write a terminating boundary when a multipart muxer is closed
    #[serde(default)]
    pub emit_final_boundary: bool,

    /// Media time an input may queue while the muxer waits for every other
    /// input's first block; past it, muxing starts without them
    #[serde(default = "default_add_stream_wait_us")]
    pub add_stream_wait_us: Mtime,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            emit_final_boundary: false,
            add_stream_wait_us: default_add_stream_wait_us(),
        }
    }
}

/// Decoder thread settings
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DecoderConfig {
    /// Prefix for decoder thread names (suffix is a counter)
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_add_stream_wait_us() -> Mtime {
    DEFAULT_ADD_STREAM_WAIT_US
}

fn default_thread_name_prefix() -> String {
    "mpipe-dec".to_string()
}

impl TomlConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from an explicit file
    ///
    /// Unlike [`TomlConfig::load`], a missing file is an error here: the caller
    /// asked for this exact path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Resolve and load configuration following the priority order
    ///
    /// Explicit paths (CLI or environment) must exist and parse. The platform
    /// default file is optional: when absent, compiled defaults are used.
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        match resolve_config_path(cli_path) {
            ConfigSource::Explicit(path) => {
                debug!("Loading config from {}", path.display());
                Self::from_file(&path)
            }
            ConfigSource::Default(path) => {
                if path.exists() {
                    debug!("Loading config from {}", path.display());
                    Self::from_file(&path)
                } else {
                    debug!("No config file at {}, using defaults", path.display());
                    Ok(Self::default())
                }
            }
            ConfigSource::Compiled => {
                warn!("Could not determine config directory, using compiled defaults");
                Ok(Self::default())
            }
        }
    }
}

/// Where the configuration should come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Path given on the command line or through the environment
    Explicit(PathBuf),
    /// Platform default location (may not exist)
    Default(PathBuf),
    /// No file location available on this platform
    Compiled,
}

/// Resolve the config file location following the priority order
pub fn resolve_config_path(cli_path: Option<&Path>) -> ConfigSource {
    // Priority 1: Command-line argument
    if let Some(path) = cli_path {
        return ConfigSource::Explicit(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return ConfigSource::Explicit(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config directory
    match dirs::config_dir() {
        Some(dir) => ConfigSource::Default(dir.join("mpipe").join("config.toml")),
        None => ConfigSource::Compiled,
    }
}
