//! Recoverable conditions reported while ingesting documents.

use serde::Serialize;
use std::fmt;

/// Category of a recoverable condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Document arrived in a state that cannot accept it.
    ProtocolViolation,
    /// Event keys differ from the descriptor's declared columns.
    ColumnMismatch,
    /// Document kind the writer does not know.
    UnknownKind,
    /// Document body could not be interpreted.
    MalformedDocument,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiagnosticKind::ProtocolViolation => "protocol violation",
            DiagnosticKind::ColumnMismatch => "column mismatch",
            DiagnosticKind::UnknownKind => "unknown document kind",
            DiagnosticKind::MalformedDocument => "malformed document",
        };
        f.write_str(name)
    }
}

/// One reported condition, with the kind of document that caused it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    /// Category.
    pub kind: DiagnosticKind,
    /// Kind of the offending document.
    pub document: String,
    /// What was wrong and what was done about it.
    pub message: String,
}

impl Diagnostic {
    /// Build a diagnostic for a document of kind `document`.
    pub fn new(kind: DiagnosticKind, document: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            document: document.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind, self.document, self.message)
    }
}

/// Ordered log of diagnostics; every entry is also emitted as a `tracing` warning.
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    /// Log `diagnostic` as a warning and keep it.
    pub fn report(&mut self, diagnostic: Diagnostic) {
        tracing::warn!(
            kind = %diagnostic.kind,
            document = %diagnostic.document,
            "{}",
            diagnostic.message
        );
        self.entries.push(diagnostic);
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    /// Remove and return all entries.
    pub fn take(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.entries)
    }

    /// Number of entries of `kind`.
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.entries.iter().filter(|d| d.kind == kind).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_and_take() {
        let mut diags = Diagnostics::default();
        diags.report(Diagnostic::new(
            DiagnosticKind::ColumnMismatch,
            "event",
            "missing column 'b'",
        ));
        diags.report(Diagnostic::new(DiagnosticKind::UnknownKind, "bulk_events", "ignored"));

        assert_eq!(diags.count(DiagnosticKind::ColumnMismatch), 1);
        assert_eq!(diags.entries().len(), 2);
        assert_eq!(
            diags.entries()[0].to_string(),
            "column mismatch (event): missing column 'b'"
        );

        let taken = diags.take();
        assert_eq!(taken.len(), 2);
        assert!(diags.entries().is_empty());
    }
}
