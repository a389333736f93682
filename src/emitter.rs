//! Line Emitter - SPEC record formatting
//!
//! Every record the writer produces goes through [`LineEmitter::write_line`],
//! which refuses text containing a line terminator. A logical record therefore
//! always occupies exactly the physical lines listed below.
//!
//! ```text
//! #F file name                 ┐
//! #E epoch seconds             │ file header (newfile)
//! #D date                      │
//! #C program  user = u  host = h
//! <blank>                      ┘
//! #S n command                 ┐
//! #D date                      │ scan header (start); #D always follows #S
//! #C date.  plan_type = ...    │
//! #C date.  uid = ...          │
//! #MD key = value              ┘
//! #C date.  stream = s  seq_num = k   ┐ side-stream event before the labels
//! #O0 name  name ...                  │ (numbered continuation,
//! #P0 value value ...                 ┘  fixed items per line)
//! #N count                     ┐ column labels (data descriptor)
//! #L label  label ...          ┘
//! v v v                          data row (data event)
//! #C date.  stream = s  seq_num = k  name = value ...
//!                                side-stream event among the data rows
//! #C date.  num_events_s = k   ┐
//! #C date.  exit_status = ...  │ footer (stop)
//! <blank>                      ┘
//! ```
//!
//! A record with nothing to list (no columns, no values) is not written, so a
//! blank line only ever ends a header or a scan block.

use crate::config::Timezone;
use crate::document::StartDoc;
use crate::error::{SpecWriterError, WriterResult};
use crate::scan::ClosedRun;
use crate::value::{escape, ArgValue};
use chrono::{DateTime, Local, Utc};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};

/// SPEC's ctime-style date format.
pub const SPEC_TIME_FORMAT: &str = "%a %b %d %H:%M:%S %Y";

/// Cell written for a missing or null value.
pub const MISSING_VALUE: &str = "nan";

/// Labels of the optional elapsed-time columns.
pub const EPOCH_LABELS: [&str; 2] = ["Epoch_float", "Epoch"];

/// Contents of the file-level header.
#[derive(Debug, Clone)]
pub struct FileHeader {
    /// Name written on `#F`.
    pub file_name: String,
    /// Creation time, epoch seconds.
    pub epoch: f64,
    /// Program named in the `#C` comment.
    pub program: String,
    pub user: String,
    /// Host named in the `#C` comment.
    pub host: String,
}

/// Writes SPEC records to an output sink.
pub struct LineEmitter<W: Write> {
    out: W,
    path: PathBuf,
    timezone: Timezone,
    items_per_line: usize,
}

impl<W: Write> LineEmitter<W> {
    /// `path` only labels I/O errors.
    pub fn new(out: W, path: &Path, timezone: Timezone, items_per_line: usize) -> Self {
        Self {
            out,
            path: path.to_path_buf(),
            timezone,
            items_per_line: items_per_line.max(1),
        }
    }

    /// The underlying sink.
    pub fn get_ref(&self) -> &W {
        &self.out
    }

    /// Consume the emitter, returning the sink.
    pub fn into_inner(self) -> W {
        self.out
    }

    /// Append one physical line.
    pub fn write_line(&mut self, record: &'static str, text: &str) -> WriterResult<()> {
        if text.contains(['\n', '\r']) {
            return Err(SpecWriterError::LineStructure {
                record,
                text: text.to_string(),
            });
        }
        writeln!(self.out, "{text}").map_err(|e| SpecWriterError::io(&self.path, e))
    }

    /// Flush the sink.
    pub fn flush(&mut self) -> WriterResult<()> {
        self.out
            .flush()
            .map_err(|e| SpecWriterError::io(&self.path, e))
    }

    /// Format seconds since the epoch as a SPEC date.
    pub fn format_time(&self, epoch: f64) -> String {
        format_time(epoch, self.timezone)
    }

    /// `#F`, `#E`, `#D`, `#C` and a blank line.
    pub fn emit_file_header(&mut self, header: &FileHeader) -> WriterResult<()> {
        let date = self.format_time(header.epoch);
        self.write_line("file name", &format!("#F {}", escape(&header.file_name)))?;
        self.write_line("file epoch", &format!("#E {}", header.epoch.trunc() as i64))?;
        self.write_line("file date", &format!("#D {date}"))?;
        self.write_line(
            "file comment",
            &format!(
                "#C {}  user = {}  host = {}",
                escape(&header.program),
                escape(&header.user),
                escape(&header.host)
            ),
        )?;
        self.write_line("file header end", "")
    }

    /// Scan header: `#S` with the command, then `#D` on the very next line.
    pub fn emit_header(&mut self, start: &StartDoc, scan_number: u64, command: &str) -> WriterResult<()> {
        let date = self.format_time(start.time);
        self.write_line("scan header", &format!("#S {scan_number}  {command}"))?;
        self.write_line("scan date", &format!("#D {date}"))?;
        if let Some(plan_type) = &start.plan_type {
            self.write_line(
                "scan comment",
                &format!("#C {date}.  plan_type = {}", escape(plan_type)),
            )?;
        }
        self.write_line("scan comment", &format!("#C {date}.  uid = {}", escape(&start.uid)))?;
        for (key, value) in &start.metadata {
            self.write_line(
                "metadata",
                &format!("#MD {} = {}", escape(key), metadata_text(value)),
            )?;
        }
        Ok(())
    }

    /// `#N` and `#L` for the data stream's columns.
    ///
    /// Returns `false`, writing nothing, when there are no labels.
    pub fn emit_column_labels(&mut self, columns: &[String], epoch_columns: bool) -> WriterResult<bool> {
        let mut labels: Vec<String> = Vec::with_capacity(columns.len() + 2);
        if epoch_columns {
            labels.extend(EPOCH_LABELS.iter().map(|l| l.to_string()));
        }
        labels.extend(columns.iter().map(|c| format_label(c)));
        if labels.is_empty() {
            return Ok(false);
        }
        self.write_line("column count", &format!("#N {}", labels.len()))?;
        self.write_line("column labels", &format!("#L {}", labels.join("  ")))?;
        Ok(true)
    }

    /// One data row: values of `columns` in order, missing ones as `nan`.
    ///
    /// `elapsed` fills the epoch columns when they are enabled.
    pub fn emit_event(
        &mut self,
        columns: &[String],
        data: &Map<String, Value>,
        elapsed: Option<f64>,
    ) -> WriterResult<()> {
        let mut cells: Vec<String> = Vec::with_capacity(columns.len() + 2);
        if let Some(elapsed) = elapsed {
            cells.push(crate::value::format_float(elapsed));
            cells.push(format!("{}", elapsed.round() as i64));
        }
        cells.extend(columns.iter().map(|c| cell_for(data.get(c))));
        if cells.is_empty() {
            return Ok(());
        }
        self.write_line("data row", &cells.join(" "))
    }

    /// Side-stream event as `#O`/`#P` records using numbered continuation.
    pub fn emit_side_event(
        &mut self,
        stream: &str,
        seq_num: i64,
        time: f64,
        columns: &[String],
        data: &Map<String, Value>,
    ) -> WriterResult<()> {
        let date = self.format_time(time);
        self.write_line(
            "stream comment",
            &format!("#C {date}.  stream = {}  seq_num = {seq_num}", escape(stream)),
        )?;
        let names: Vec<String> = columns.iter().map(|c| format_label(c)).collect();
        let values: Vec<String> = columns.iter().map(|c| cell_for(data.get(c))).collect();
        self.emit_numbered("positioner names", "#O", &names, "  ")?;
        self.emit_numbered("positioner values", "#P", &values, " ")
    }

    /// Side-stream event as one comment, for events arriving after `#L`.
    pub fn emit_side_comment(
        &mut self,
        stream: &str,
        seq_num: i64,
        time: f64,
        columns: &[String],
        data: &Map<String, Value>,
    ) -> WriterResult<()> {
        let mut text = format!(
            "#C {}.  stream = {}  seq_num = {seq_num}",
            self.format_time(time),
            escape(stream)
        );
        for column in columns {
            text.push_str(&format!(
                "  {} = {}",
                format_label(column),
                cell_for(data.get(column))
            ));
        }
        self.write_line("stream comment", &text)
    }

    fn emit_numbered(
        &mut self,
        record: &'static str,
        marker: &str,
        items: &[String],
        separator: &str,
    ) -> WriterResult<()> {
        for (index, chunk) in items.chunks(self.items_per_line).enumerate() {
            self.write_line(record, &format!("{marker}{index} {}", chunk.join(separator)))?;
        }
        Ok(())
    }

    /// Closing comments and the blank line that ends the scan block.
    pub fn emit_footer(
        &mut self,
        time: f64,
        exit_status: &str,
        reason: &str,
        closed: &ClosedRun,
    ) -> WriterResult<()> {
        let date = self.format_time(time);
        for (stream, count) in &closed.event_counts {
            self.write_line(
                "scan comment",
                &format!("#C {date}.  num_events_{} = {count}", escape(stream)),
            )?;
        }
        self.write_line(
            "scan comment",
            &format!("#C {date}.  exit_status = {}", escape(exit_status)),
        )?;
        if !reason.is_empty() {
            self.write_line("scan comment", &format!("#C {date}.  reason = {}", escape(reason)))?;
        }
        self.write_line("scan end", "")
    }
}

/// Format seconds since the epoch as a SPEC date in the given zone.
pub fn format_time(epoch: f64, timezone: Timezone) -> String {
    let secs = epoch.floor() as i64;
    let nanos = ((epoch - epoch.floor()) * 1e9) as u32;
    let utc: DateTime<Utc> = DateTime::from_timestamp(secs, nanos.min(999_999_999))
        .unwrap_or_default();
    match timezone {
        Timezone::Utc => utc.format(SPEC_TIME_FORMAT).to_string(),
        Timezone::Local => utc.with_timezone(&Local).format(SPEC_TIME_FORMAT).to_string(),
    }
}

/// Text of one data cell; never empty, never contains whitespace.
pub fn format_cell(value: &Value) -> String {
    match value {
        Value::Null => MISSING_VALUE.to_string(),
        Value::Bool(true) => "1".to_string(),
        Value::Bool(false) => "0".to_string(),
        Value::String(s) if s.is_empty() => "\"\"".to_string(),
        Value::String(s) => without_whitespace(&escape(s)),
        other => without_whitespace(&ArgValue::from_json(other).render()),
    }
}

/// Text of one `#L`/`#O` label; never contains a run of whitespace.
pub fn format_label(name: &str) -> String {
    let label = escape(name).split_whitespace().collect::<Vec<_>>().join(" ");
    if label.is_empty() {
        "_".to_string()
    } else {
        label
    }
}

fn cell_for(value: Option<&Value>) -> String {
    value.map_or_else(|| MISSING_VALUE.to_string(), format_cell)
}

fn without_whitespace(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

fn metadata_text(value: &Value) -> String {
    match value {
        Value::String(s) => escape(s),
        other => ArgValue::from_json(other).render(),
    }
}
