//! Daemon configuration.
//!
//! Configuration merges in layers, lowest priority first: compiled-in
//! defaults, the TOML config file, `GANTRY_*` environment variables,
//! and finally CLI overrides applied by the binary. All types
//! implement [`Default`] for the compiled-in layer.
//!
//! # Environment Variables
//!
//! - `GANTRY_DEBUG`: enable debug mode (`true`/`false`)
//! - `GANTRY_SPI_DEVICE`: SPI device node path
//! - `GANTRY_MACRO_DIR`: macro directory
//! - `GANTRY_STATE_FILE`: running-plugins state file

use crate::transfer::TransferConfig;
use gantry_types::ErrorCode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration load failure.
///
/// | Variant | Code | Recoverable |
/// |---------|------|-------------|
/// | [`ConfigError::Io`] | `CONFIG_IO` | No |
/// | [`ConfigError::Parse`] | `CONFIG_PARSE` | No |
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("cannot read {path}: {message}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error text.
        message: String,
    },

    /// The config file is not valid TOML for this schema.
    #[error("cannot parse {path}: {message}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Parser error text.
        message: String,
    },
}

impl ErrorCode for ConfigError {
    fn code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "CONFIG_IO",
            Self::Parse { .. } => "CONFIG_PARSE",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GantryConfig {
    /// Enable debug mode (verbose logging, diagnostics).
    pub debug: bool,

    /// SPI link configuration.
    pub spi: SpiConfig,

    /// Job executor configuration.
    pub job: JobConfig,

    /// Path configuration.
    pub paths: PathsConfig,
}

impl GantryConfig {
    /// Loads configuration from `path` (when given and present) plus
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when an explicitly given file is
    /// unreadable or unparseable.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = path {
            let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
            let file_config = Self::from_toml(&text).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
            config.merge(&file_config);
        }
        config.apply_env();
        Ok(config)
    }

    /// Serialises to TOML.
    ///
    /// # Errors
    ///
    /// Returns the serialiser error.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Deserialises from TOML.
    ///
    /// # Errors
    ///
    /// Returns the parser error.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Merges another config into this one; values from `other`
    /// override only where they differ from the defaults.
    pub fn merge(&mut self, other: &Self) {
        let default = Self::default();
        if other.debug != default.debug {
            self.debug = other.debug;
        }
        self.spi.merge(&other.spi);
        self.job.merge(&other.job);
        self.paths.merge(&other.paths);
    }

    fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("GANTRY_DEBUG") {
            self.debug = matches!(value.as_str(), "1" | "true" | "yes");
        }
        if let Ok(value) = std::env::var("GANTRY_SPI_DEVICE") {
            self.spi.device = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("GANTRY_MACRO_DIR") {
            self.paths.macro_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("GANTRY_STATE_FILE") {
            self.paths.state_file = PathBuf::from(value);
        }
    }
}

/// SPI link configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SpiConfig {
    /// SPI device node.
    pub device: PathBuf,

    /// Handshake timeout in milliseconds.
    pub handshake_timeout_ms: u64,

    /// Resync holdoff in milliseconds; at least twice the firmware's
    /// cycle time.
    pub resync_holdoff_ms: u64,

    /// Consecutive CRC failures before a resync.
    pub crc_retry_limit: u32,

    /// Consecutive resync failures before the link is declared lost.
    pub resync_limit: u32,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/spidev0.0"),
            handshake_timeout_ms: 4000,
            resync_holdoff_ms: 100,
            crc_retry_limit: 3,
            resync_limit: 10,
        }
    }
}

impl SpiConfig {
    /// Transfer-engine view of this config.
    #[must_use]
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            resync_holdoff: Duration::from_millis(self.resync_holdoff_ms),
            crc_retry_limit: self.crc_retry_limit,
            resync_limit: self.resync_limit,
        }
    }

    fn merge(&mut self, other: &Self) {
        let default = Self::default();
        if other.device != default.device {
            self.device = other.device.clone();
        }
        if other.handshake_timeout_ms != default.handshake_timeout_ms {
            self.handshake_timeout_ms = other.handshake_timeout_ms;
        }
        if other.resync_holdoff_ms != default.resync_holdoff_ms {
            self.resync_holdoff_ms = other.resync_holdoff_ms;
        }
        if other.crc_retry_limit != default.crc_retry_limit {
            self.crc_retry_limit = other.crc_retry_limit;
        }
        if other.resync_limit != default.resync_limit {
            self.resync_limit = other.resync_limit;
        }
    }
}

/// Job executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobConfig {
    /// Codes read ahead of the oldest incomplete one.
    pub buffered_codes: usize,

    /// Per-code reply deadline in milliseconds.
    pub reply_timeout_ms: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            buffered_codes: 8,
            reply_timeout_ms: 30_000,
        }
    }
}

impl JobConfig {
    /// Per-code reply deadline.
    #[must_use]
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    fn merge(&mut self, other: &Self) {
        let default = Self::default();
        if other.buffered_codes != default.buffered_codes {
            self.buffered_codes = other.buffered_codes;
        }
        if other.reply_timeout_ms != default.reply_timeout_ms {
            self.reply_timeout_ms = other.reply_timeout_ms;
        }
    }
}

/// Path configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory containing macro files.
    pub macro_dir: PathBuf,

    /// Running-plugins state file, written at shutdown.
    pub state_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            macro_dir: PathBuf::from("/opt/gantry/sys"),
            state_file: PathBuf::from("/var/lib/gantry/plugins.txt"),
        }
    }
}

impl PathsConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();
        if other.macro_dir != default.macro_dir {
            self.macro_dir = other.macro_dir.clone();
        }
        if other.state_file != default.state_file {
            self.state_file = other.state_file.clone();
        }
    }
}
