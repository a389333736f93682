//! Writer configuration using Figment
//!
//! Configuration is loaded from:
//! 1. A TOML file (base configuration)
//! 2. Environment variables (prefixed with `SPECWRITER_`)
//!
//! Every field has a default, so an empty or missing file yields
//! [`SpecWriterConfig::default()`].
//!
//! # Example
//! ```no_run
//! use specwriter::config::SpecWriterConfig;
//!
//! let config = SpecWriterConfig::load_from("config/specwriter.toml")?;
//! config.validate()?;
//! println!("Data stream: {}", config.data_stream);
//! # Ok::<(), specwriter::error::SpecWriterError>(())
//! ```

use crate::error::{SpecWriterError, WriterResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Zone used when formatting `#D` and `#C` dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timezone {
    /// Host's local zone.
    Local,
    /// Coordinated Universal Time.
    Utc,
}

/// What to do with an event whose keys differ from its descriptor's columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnMismatchPolicy {
    /// Write the row anyway: missing columns as `nan`, extra keys dropped.
    Coerce,
    /// Drop the event.
    Skip,
}

/// Top-level writer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SpecWriterConfig {
    /// Stream whose events become data rows
    pub data_stream: String,
    /// Handling of events whose keys differ from the declared columns
    pub column_mismatch: ColumnMismatchPolicy,
    /// Prepend `Epoch_float` and `Epoch` columns (seconds since run start)
    pub epoch_columns: bool,
    /// Items per `#O`/`#P` line
    pub positioners_per_line: usize,
    /// Zone for `#D` and `#C` dates
    pub timezone: Timezone,
    /// Program name in the file header comment
    pub program: String,
    /// Overrides the detected user name
    pub user: Option<String>,
    /// Overrides the detected host name
    pub host: Option<String>,
    /// Create a file when a run starts and none is open
    pub auto_create: bool,
    /// Directory for automatically created files
    pub output_dir: PathBuf,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for SpecWriterConfig {
    fn default() -> Self {
        Self {
            data_stream: "primary".to_string(),
            column_mismatch: ColumnMismatchPolicy::Coerce,
            epoch_columns: false,
            positioners_per_line: 8,
            timezone: Timezone::Local,
            program: "Bluesky".to_string(),
            user: None,
            host: None,
            auto_create: false,
            output_dir: PathBuf::from("."),
            log_level: "info".to_string(),
        }
    }
}

impl SpecWriterConfig {
    /// Load configuration from a specific file path
    ///
    /// Environment variables override the file with prefix SPECWRITER_
    /// Example: SPECWRITER_EPOCH_COLUMNS=true
    pub fn load_from<P: AsRef<Path>>(path: P) -> WriterResult<Self> {
        let config = Figment::from(Serialized::defaults(SpecWriterConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SPECWRITER_"))
            .extract()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, without a file.
    pub fn from_env() -> WriterResult<Self> {
        let config = Figment::from(Serialized::defaults(SpecWriterConfig::default()))
            .merge(Env::prefixed("SPECWRITER_"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> WriterResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(SpecWriterError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if !(1..=64).contains(&self.positioners_per_line) {
            return Err(SpecWriterError::Configuration(format!(
                "Invalid positioners_per_line {}. Must be 1-64",
                self.positioners_per_line
            )));
        }

        if self.data_stream.trim().is_empty() {
            return Err(SpecWriterError::Configuration(
                "data_stream must not be empty".to_string(),
            ));
        }

        if self.program.contains(['\n', '\r']) {
            return Err(SpecWriterError::Configuration(
                "program must be a single line".to_string(),
            ));
        }

        Ok(())
    }

    /// Set the date zone.
    pub fn with_timezone(mut self, timezone: Timezone) -> Self {
        self.timezone = timezone;
        self
    }

    /// Enable or disable the elapsed-time columns.
    pub fn with_epoch_columns(mut self, enabled: bool) -> Self {
        self.epoch_columns = enabled;
        self
    }

    /// Set the column mismatch policy.
    pub fn with_column_mismatch(mut self, policy: ColumnMismatchPolicy) -> Self {
        self.column_mismatch = policy;
        self
    }

    /// Fix the user and host written in the file header.
    pub fn with_identity(mut self, user: &str, host: &str) -> Self {
        self.user = Some(user.to_string());
        self.host = Some(host.to_string());
        self
    }

    /// Create files in `output_dir` when a run starts with none open.
    pub fn with_auto_create(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.auto_create = true;
        self.output_dir = output_dir.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SpecWriterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.data_stream, "primary");
        assert_eq!(config.column_mismatch, ColumnMismatchPolicy::Coerce);
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
data_stream = "main"
column_mismatch = "skip"
timezone = "utc"
positioners_per_line = 4
user = "operator"
"#
        )
        .unwrap();

        let config = SpecWriterConfig::load_from(file.path()).unwrap();
        assert_eq!(config.data_stream, "main");
        assert_eq!(config.column_mismatch, ColumnMismatchPolicy::Skip);
        assert_eq!(config.timezone, Timezone::Utc);
        assert_eq!(config.positioners_per_line, 4);
        assert_eq!(config.user.as_deref(), Some("operator"));
        // untouched keys keep their defaults
        assert_eq!(config.program, "Bluesky");
        assert!(!config.epoch_columns);
    }

    #[test]
    fn test_sample_config_matches_defaults() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/specwriter.toml");
        let config = SpecWriterConfig::load_from(path).unwrap();
        assert_eq!(config, SpecWriterConfig::default());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = SpecWriterConfig::load_from("/nonexistent/specwriter.toml").unwrap();
        assert_eq!(config.positioners_per_line, 8);
    }

    #[test]
    fn test_bad_enum_value_is_config_error() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, r#"timezone = "mars""#).unwrap();
        let err = SpecWriterConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, SpecWriterError::Config(_)));
    }

    #[test]
    fn test_config_validation() {
        let mut config = SpecWriterConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.positioners_per_line = 0;
        assert!(config.validate().is_err());

        config.positioners_per_line = 8;
        config.data_stream = "  ".to_string();
        assert!(config.validate().is_err());
    }
}
