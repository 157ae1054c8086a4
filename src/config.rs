//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for the execution engine.
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with `LABEXEC_`, nested keys split on `__`)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! LABEXEC_CHIP__NAME="wafer7_die3"
//! LABEXEC_EXECUTION__PAUSE_AFTER_EACH_DEVICE=true
//! LABEXEC_EXECUTION__INTER_MEASUREMENT_WAIT="2s"
//! LABEXEC_LOGGING__LEVEL=debug
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rust_labexec::config::Settings;
//!
//! let settings = Settings::load_from("config/labexec.toml")?;
//! println!("Chip: {}", settings.chip.name);
//! println!("Output: {}", settings.output.raw_output_path.display());
//! # Ok::<(), rust_labexec::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Chip under test
    #[serde(default)]
    pub chip: ChipConfig,
    /// Where records are written
    #[serde(default)]
    pub output: OutputConfig,
    /// Execution control flags
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Logging settings for the binary
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Chip identity written into every record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChipConfig {
    /// Chip name, used as the first component of every output file name
    #[serde(default = "default_chip_name")]
    pub name: String,
    /// Path of the chip description file
    #[serde(default)]
    pub description_path: String,
}

impl Default for ChipConfig {
    fn default() -> Self {
        Self {
            name: default_chip_name(),
            description_path: String::new(),
        }
    }
}

/// Output location configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory receiving raw measurement records
    #[serde(default = "default_output_path")]
    pub raw_output_path: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            raw_output_path: default_output_path(),
        }
    }
}

/// What the engine does when a ToDo fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Stop the invocation and leave the failed ToDo at the queue head.
    #[default]
    Halt,
    /// Re-run the failed head ToDo immediately, up to `max_attempts` in total.
    RetryHead,
}

/// Execution control flags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Stop after every ToDo, leaving the rest of the queue for the next invocation
    #[serde(default)]
    pub pause_after_each_device: bool,
    /// Move the stages to each device before measuring
    #[serde(default)]
    pub auto_move_stages: bool,
    /// Run a search for peak before measuring
    #[serde(default)]
    pub search_for_peak: bool,
    /// Wait between two consecutive ToDos
    #[serde(default, with = "humantime_serde")]
    pub inter_measurement_wait: Duration,
    /// A record flushes to its temp file after this many writes
    #[serde(default = "default_autosave_every")]
    pub autosave_every: usize,
    /// Failure policy
    #[serde(default)]
    pub on_failure: OnFailure,
    /// Total attempts per ToDo under `retry_head`
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            pause_after_each_device: false,
            auto_move_stages: false,
            search_for_peak: false,
            inter_measurement_wait: Duration::ZERO,
            autosave_every: default_autosave_every(),
            on_failure: OnFailure::Halt,
            max_attempts: default_max_attempts(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_chip_name() -> String {
    "UnknownChip".to_string()
}

fn default_output_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("laboratory_measurements")
}

fn default_autosave_every() -> usize {
    50
}

fn default_max_attempts() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from a TOML file and `LABEXEC_` environment variables.
    ///
    /// Environment variables take precedence over the file. A missing file is not an
    /// error; every key has a default. The result is validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Settings::default()))
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("LABEXEC_").split("__")),
        )
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> AppResult<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Settings::default()))
                .merge(Env::prefixed("LABEXEC_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> AppResult<Self> {
        let settings: Self = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - `autosave_every` and `max_attempts` are non-zero
    /// - The chip name is not empty
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.execution.autosave_every == 0 {
            return Err(DaqError::Configuration(
                "execution.autosave_every must be > 0".to_string(),
            ));
        }

        if self.execution.max_attempts == 0 {
            return Err(DaqError::Configuration(
                "execution.max_attempts must be > 0".to_string(),
            ));
        }

        if self.chip.name.trim().is_empty() {
            return Err(DaqError::Configuration(
                "chip.name cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
