//! Custom error types for the SPEC writer.
//!
//! This module defines `SpecWriterError`, the error type for conditions the
//! writer cannot recover from. Using the `thiserror` crate, it provides a
//! centralized and consistent way to report them to the caller.
//!
//! ## Error Hierarchy
//!
//! Only conditions that would leave the output file unable to honour its
//! line structure are errors. Everything else (protocol violations, column
//! mismatches, unknown document kinds, malformed documents) is recovered
//! locally and reported as a [`Diagnostic`](crate::diagnostic::Diagnostic).
//!
//! - **`Io`**: the output file could not be created, written, or flushed.
//! - **`NoOutputFile`**: a run started before any file was opened and
//!   automatic file creation is disabled.
//! - **`LineStructure`**: text containing a line terminator reached the
//!   single-line write primitive.
//! - **`Config`** / **`Configuration`**: configuration could not be loaded
//!   or failed validation.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the writer error type.
pub type WriterResult<T> = std::result::Result<T, SpecWriterError>;

/// Errors that stop a document from being written.
#[derive(Error, Debug)]
pub enum SpecWriterError {
    /// Creating, writing or flushing the output file failed.
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        /// File the operation was on.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A start arrived with no file open and auto-create off.
    #[error("No output file is open. Call newfile() or enable auto_create")]
    NoOutputFile,

    /// A record's text would span more than one line.
    #[error("Refusing to write {record} containing a line terminator: {text:?}")]
    LineStructure {
        /// Record being written.
        record: &'static str,
        /// Offending text.
        text: String,
    },

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but is invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl SpecWriterError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the writer can keep accepting documents after this error.
    pub fn can_recover(&self) -> bool {
        matches!(self, Self::NoOutputFile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_names_path() {
        let err = SpecWriterError::io(
            "/tmp/out.spec",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/out.spec"));
        assert!(msg.contains("denied"));
        assert!(!err.can_recover());
    }

    #[test]
    fn test_line_structure_message_escapes_newline() {
        let err = SpecWriterError::LineStructure {
            record: "scan header",
            text: "a\nb".to_string(),
        };
        assert_eq!(err.to_string().lines().count(), 1);
    }
}
