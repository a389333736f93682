//! SPEC file writer - consumes run documents, appends SPEC records
//!
//! [`SpecWriter`] owns everything one output file needs: the open file, the
//! scan record, the configuration and the diagnostic log. Documents arrive
//! through [`SpecWriter::receiver`] (untyped `(kind, body)` pairs) or
//! [`SpecWriter::write`] (already typed).
//!
//! # Lifecycle
//!
//! - [`SpecWriter::newfile`] creates (truncates) a file, writes the file
//!   header and restarts scan numbering.
//! - A start document with no file open either creates one under
//!   `output_dir` (when `auto_create` is set) or fails with
//!   [`SpecWriterError::NoOutputFile`].
//! - The file is flushed after every document, so a reader tailing it never
//!   sees a partial record.
//!
//! Every document is handled inside a `debug_span!("document", kind)`.

use crate::config::{SpecWriterConfig, Timezone};
use crate::diagnostic::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::dispatch::{self, DispatchContext};
use crate::document::{Document, DocumentKind};
use crate::emitter::{FileHeader, LineEmitter};
use crate::error::{SpecWriterError, WriterResult};
use crate::scan::{ScanRecord, ScanState};
use chrono::{DateTime, Local, Utc};
use serde_json::Value;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of "now" in seconds since the epoch.
pub type Clock = Box<dyn Fn() -> f64 + Send>;

struct OutputFile {
    path: PathBuf,
    emitter: LineEmitter<BufWriter<File>>,
}

/// Writes one SPEC data file from a stream of run documents.
pub struct SpecWriter {
    config: SpecWriterConfig,
    clock: Clock,
    output: Option<OutputFile>,
    record: ScanRecord,
    diagnostics: Diagnostics,
}

impl SpecWriter {
    /// Writer with no file open; call [`SpecWriter::newfile`] or enable auto-create.
    pub fn new(config: SpecWriterConfig) -> Self {
        Self {
            config,
            clock: Box::new(system_time),
            output: None,
            record: ScanRecord::default(),
            diagnostics: Diagnostics::default(),
        }
    }

    /// Replace the clock used for the file header's `#E`/`#D`.
    pub fn with_clock(mut self, clock: impl Fn() -> f64 + Send + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &SpecWriterConfig {
        &self.config
    }

    /// Start a new file; the next run gets scan number 1 unless its own
    /// `scan_id` is larger.
    pub fn newfile(&mut self, path: impl AsRef<Path>) -> WriterResult<()> {
        self.newfile_with_scan_id(path, 0)
    }

    /// Start a new file whose numbering continues after `last_scan_id`.
    pub fn newfile_with_scan_id(&mut self, path: impl AsRef<Path>, last_scan_id: u64) -> WriterResult<()> {
        let path = path.as_ref();
        self.close()?;

        let file = File::create(path).map_err(|e| SpecWriterError::io(path, e))?;
        let mut emitter = LineEmitter::new(
            BufWriter::new(file),
            path,
            self.config.timezone,
            self.config.positioners_per_line,
        );
        emitter.emit_file_header(&self.file_header(path))?;
        emitter.flush()?;

        self.output = Some(OutputFile {
            path: path.to_path_buf(),
            emitter,
        });
        self.record.reset(last_scan_id);
        tracing::info!(path = %path.display(), last_scan_id, "SPEC file created");
        Ok(())
    }

    /// Path of the current output file, if any.
    pub fn spec_filename(&self) -> Option<&Path> {
        self.output.as_ref().map(|output| output.path.as_path())
    }

    /// State of the scan record.
    pub fn scan_state(&self) -> ScanState {
        self.record.state()
    }

    /// Most recently assigned scan number.
    pub fn last_scan_number(&self) -> u64 {
        self.record.last_scan_number()
    }

    /// Recoverable problems seen so far.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        self.diagnostics.entries()
    }

    /// Drain the diagnostic log.
    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        self.diagnostics.take()
    }

    /// Accept one document as delivered by a run engine callback.
    ///
    /// Unknown kinds and bodies that do not fit their kind are recorded as
    /// diagnostics; only I/O failures and a start without an output file are
    /// returned as errors.
    pub fn receiver(&mut self, kind: &str, body: Value) -> WriterResult<()> {
        let kind = DocumentKind::parse(kind);
        let _span = tracing::debug_span!("document", kind = %kind).entered();

        match Document::from_parts(&kind, body) {
            None => {
                self.diagnostics.report(Diagnostic::new(
                    DiagnosticKind::UnknownKind,
                    kind.as_str(),
                    format!("unknown document kind '{kind}' ignored"),
                ));
                Ok(())
            }
            Some(Err(e)) => {
                self.diagnostics.report(Diagnostic::new(
                    DiagnosticKind::MalformedDocument,
                    kind.as_str(),
                    format!("{kind} document could not be read: {e}"),
                ));
                Ok(())
            }
            Some(Ok(document)) => self.handle(document),
        }
    }

    /// Accept one typed document.
    pub fn write(&mut self, document: Document) -> WriterResult<()> {
        let kind = document.kind();
        let _span = tracing::debug_span!("document", kind = %kind).entered();
        self.handle(document)
    }

    /// Flush and release the current file.
    pub fn close(&mut self) -> WriterResult<()> {
        if let Some(mut output) = self.output.take() {
            output.emitter.flush()?;
            if self.record.state() == ScanState::Open {
                tracing::warn!(path = %output.path.display(), "File closed with a scan still open");
            }
            tracing::debug!(path = %output.path.display(), "SPEC file closed");
        }
        Ok(())
    }

    fn handle(&mut self, document: Document) -> WriterResult<()> {
        if self.output.is_none() {
            match &document {
                Document::Start(start) if self.config.auto_create => {
                    let path = self.auto_path(start.time);
                    if let Some(dir) = path.parent() {
                        fs::create_dir_all(dir).map_err(|e| SpecWriterError::io(dir, e))?;
                    }
                    let last = self.record.last_scan_number();
                    self.newfile_with_scan_id(&path, last)?;
                }
                Document::Start(_) => return Err(SpecWriterError::NoOutputFile),
                other => {
                    self.diagnostics.report(Diagnostic::new(
                        DiagnosticKind::ProtocolViolation,
                        other.kind().as_str(),
                        "no output file is open",
                    ));
                    return Ok(());
                }
            }
        }

        let Some(output) = self.output.as_mut() else {
            return Err(SpecWriterError::NoOutputFile);
        };
        let mut ctx = DispatchContext {
            record: &mut self.record,
            emitter: &mut output.emitter,
            config: &self.config,
            diagnostics: &mut self.diagnostics,
        };
        dispatch::dispatch(&mut ctx, document)?;
        output.emitter.flush()
    }

    fn file_header(&self, path: &Path) -> FileHeader {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        FileHeader {
            file_name,
            epoch: (self.clock)(),
            program: self.config.program.clone(),
            user: self.config.user.clone().unwrap_or_else(current_user),
            host: self.config.host.clone().unwrap_or_else(current_host),
        }
    }

    /// `<output_dir>/<YYYYMMDD-HHMMSS>.dat` from the run's start time.
    fn auto_path(&self, start_time: f64) -> PathBuf {
        let utc = DateTime::<Utc>::from_timestamp(start_time.floor() as i64, 0).unwrap_or_default();
        let stamp = match self.config.timezone {
            Timezone::Utc => utc.format("%Y%m%d-%H%M%S").to_string(),
            Timezone::Local => utc.with_timezone(&Local).format("%Y%m%d-%H%M%S").to_string(),
        };
        self.config.output_dir.join(format!("{stamp}.dat"))
    }
}

impl Drop for SpecWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(error = %e, "Failed to flush SPEC file");
        }
    }
}

fn system_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn current_host() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}
