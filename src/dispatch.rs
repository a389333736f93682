//! Document Dispatcher - routes typed documents to their handlers
//!
//! Dispatch holds no state of its own. Each handler receives the
//! [`DispatchContext`] (scan record, line emitter, configuration, diagnostic
//! log) and either updates state, emits lines, or reports why the document
//! was skipped.
//!
//! | kind | handler effect |
//! |------|----------------|
//! | start | open the scan, write `#S`/`#D`/`#C`/`#MD` |
//! | descriptor | register layout; first data-stream descriptor writes `#N`/`#L` |
//! | event | data row (data stream); side stream: `#O`/`#P` before `#L`, one `#C` line after |
//! | event_page | unpacked, then as event |
//! | stop | footer comments, blank line; scan closed |
//! | resource, datum, datum_page | ignored |
//!
//! Only I/O and line-structure failures are returned as errors.

use crate::command;
use crate::config::{ColumnMismatchPolicy, SpecWriterConfig};
use crate::diagnostic::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::document::{DescriptorDoc, Document, EventDoc, EventPage, StartDoc, StopDoc};
use crate::emitter::LineEmitter;
use crate::error::WriterResult;
use crate::scan::{ColumnCheck, DescriptorOutcome, ScanRecord, StreamLayout};
use std::io::Write;

/// Collaborators handed to every handler.
pub struct DispatchContext<'a, W: Write> {
    /// Scan numbering and the open run.
    pub record: &'a mut ScanRecord,
    /// Line sink of the current file.
    pub emitter: &'a mut LineEmitter<W>,
    /// Writer configuration.
    pub config: &'a SpecWriterConfig,
    /// Recoverable problems seen so far.
    pub diagnostics: &'a mut Diagnostics,
}

impl<W: Write> DispatchContext<'_, W> {
    fn report(&mut self, kind: DiagnosticKind, document: &str, message: impl Into<String>) {
        self.diagnostics.report(Diagnostic::new(kind, document, message));
    }
}

/// Route one document to its handler.
pub fn dispatch<W: Write>(ctx: &mut DispatchContext<'_, W>, document: Document) -> WriterResult<()> {
    match document {
        Document::Start(doc) => handle_start(ctx, doc),
        Document::Descriptor(doc) => handle_descriptor(ctx, doc),
        Document::Event(doc) => handle_event(ctx, doc),
        Document::EventPage(doc) => handle_event_page(ctx, doc),
        Document::Stop(doc) => handle_stop(ctx, doc),
        Document::Resource(_) | Document::Datum(_) | Document::DatumPage(_) => {
            tracing::trace!(kind = %document.kind(), "External data reference ignored");
            Ok(())
        }
    }
}

fn handle_start<W: Write>(ctx: &mut DispatchContext<'_, W>, doc: StartDoc) -> WriterResult<()> {
    let scan_number = match ctx.record.open(&doc.uid, doc.scan_id, doc.time) {
        Ok(n) => n,
        Err(violation) => {
            ctx.report(DiagnosticKind::ProtocolViolation, "start", violation.to_string());
            return Ok(());
        }
    };
    let command = command::rebuild(&doc);
    ctx.emitter.emit_header(&doc, scan_number, &command)?;
    tracing::info!(scan = scan_number, run = %doc.uid, "Scan opened");
    Ok(())
}

fn handle_descriptor<W: Write>(
    ctx: &mut DispatchContext<'_, W>,
    doc: DescriptorDoc,
) -> WriterResult<()> {
    let keys = match doc.data_keys() {
        Ok(keys) => keys,
        Err(e) => {
            ctx.report(
                DiagnosticKind::MalformedDocument,
                "descriptor",
                format!("descriptor '{}' has unreadable data_keys: {e}", doc.uid),
            );
            return Ok(());
        }
    };
    let mut layout = StreamLayout {
        stream: doc.name.clone(),
        columns: Vec::new(),
        ignored: Vec::new(),
    };
    for (name, key) in keys {
        if key.is_scalar() {
            layout.columns.push(name);
        } else {
            layout.ignored.push(name);
        }
    }
    let outcome = ctx
        .record
        .add_descriptor(&doc.uid, &doc.run_start, layout, &ctx.config.data_stream);
    match outcome {
        Ok(DescriptorOutcome::AnnounceColumns(columns)) => {
            if ctx
                .emitter
                .emit_column_labels(&columns, ctx.config.epoch_columns)?
            {
                ctx.record.begin_data_section();
                tracing::debug!(stream = %doc.name, columns = columns.len(), "Columns announced");
            } else {
                tracing::debug!(stream = %doc.name, "No scalar columns; events only counted");
            }
        }
        Ok(DescriptorOutcome::SharesLayout | DescriptorOutcome::SideStream) => {
            tracing::debug!(stream = %doc.name, descriptor = %doc.uid, "Descriptor registered");
        }
        Err(violation) => ctx.report(
            DiagnosticKind::ProtocolViolation,
            "descriptor",
            violation.to_string(),
        ),
    }
    Ok(())
}

fn handle_event<W: Write>(ctx: &mut DispatchContext<'_, W>, doc: EventDoc) -> WriterResult<()> {
    let layout = match ctx.record.layout_for(&doc.descriptor) {
        Ok(layout) => layout.clone(),
        Err(violation) => {
            ctx.report(DiagnosticKind::ProtocolViolation, "event", violation.to_string());
            return Ok(());
        }
    };

    let check = ColumnCheck::compare(&layout, &doc.data);
    if !check.is_match() {
        let policy = ctx.config.column_mismatch;
        ctx.report(
            DiagnosticKind::ColumnMismatch,
            "event",
            format!(
                "event {} of stream '{}': missing {:?}, unexpected {:?}; {}",
                doc.seq_num,
                layout.stream,
                check.missing,
                check.extra,
                match policy {
                    ColumnMismatchPolicy::Coerce => "written with declared columns",
                    ColumnMismatchPolicy::Skip => "skipped",
                }
            ),
        );
        if policy == ColumnMismatchPolicy::Skip {
            return Ok(());
        }
    }

    if layout.stream == ctx.config.data_stream {
        let elapsed = if ctx.config.epoch_columns {
            ctx.record.run().map(|run| doc.time - run.start_time)
        } else {
            None
        };
        ctx.emitter.emit_event(&layout.columns, &doc.data, elapsed)?;
    } else if ctx.record.in_data_section() {
        ctx.emitter.emit_side_comment(
            &layout.stream,
            doc.seq_num,
            doc.time,
            &layout.columns,
            &doc.data,
        )?;
    } else {
        ctx.emitter.emit_side_event(
            &layout.stream,
            doc.seq_num,
            doc.time,
            &layout.columns,
            &doc.data,
        )?;
    }
    ctx.record.record_event(&layout.stream);
    Ok(())
}

fn handle_event_page<W: Write>(ctx: &mut DispatchContext<'_, W>, page: EventPage) -> WriterResult<()> {
    let descriptor = page.descriptor.clone();
    match page.into_events() {
        Ok(events) => {
            for event in events {
                handle_event(ctx, event)?;
            }
        }
        Err(reason) => ctx.report(
            DiagnosticKind::MalformedDocument,
            "event_page",
            format!("event page for descriptor '{descriptor}': {reason}"),
        ),
    }
    Ok(())
}

fn handle_stop<W: Write>(ctx: &mut DispatchContext<'_, W>, doc: StopDoc) -> WriterResult<()> {
    let closed = match ctx.record.close(&doc.run_start) {
        Ok(closed) => closed,
        Err(violation) => {
            ctx.report(DiagnosticKind::ProtocolViolation, "stop", violation.to_string());
            return Ok(());
        }
    };
    for (stream, written) in &closed.event_counts {
        let announced = doc.num_events.get(stream).and_then(|v| v.as_u64());
        if announced.is_some_and(|n| n != *written) {
            tracing::debug!(%stream, written, ?announced, "Event count differs from stop document");
        }
    }
    ctx.emitter
        .emit_footer(doc.time, &doc.exit_status, &doc.reason, &closed)?;
    tracing::info!(
        scan = closed.scan_number,
        run = %closed.uid,
        exit_status = %doc.exit_status,
        "Scan closed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timezone;
    use crate::document::{DataKey, DocumentKind};
    use serde_json::json;
    use std::path::Path;
    use tracing_test::traced_test;

    struct Harness {
        record: ScanRecord,
        emitter: LineEmitter<Vec<u8>>,
        config: SpecWriterConfig,
        diagnostics: Diagnostics,
    }

    impl Harness {
        fn new(config: SpecWriterConfig) -> Self {
            Self {
                record: ScanRecord::default(),
                emitter: LineEmitter::new(Vec::new(), Path::new("mem"), Timezone::Utc, 8),
                config: config.with_timezone(Timezone::Utc),
                diagnostics: Diagnostics::default(),
            }
        }

        fn send(&mut self, document: Document) {
            let mut ctx = DispatchContext {
                record: &mut self.record,
                emitter: &mut self.emitter,
                config: &self.config,
                diagnostics: &mut self.diagnostics,
            };
            dispatch(&mut ctx, document).unwrap();
        }

        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.emitter.get_ref().clone())
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    fn descriptor(uid: &str, stream: &str, columns: &[&str]) -> Document {
        let mut doc = DescriptorDoc::new(uid, "run-1", stream);
        for column in columns {
            doc = doc.with_data_key(column, DataKey::scalar(column));
        }
        Document::Descriptor(doc)
    }

    fn event(descriptor: &str, seq_num: i64, data: serde_json::Value) -> Document {
        let mut doc = EventDoc::new(descriptor, seq_num, 100.0 + seq_num as f64);
        for (key, value) in data.as_object().unwrap() {
            doc = doc.with_datum(key, value.clone());
        }
        Document::Event(doc)
    }

    fn start() -> Document {
        Document::Start(
            StartDoc::new("run-1", 100.0)
                .with_plan("count", "generator")
                .with_scan_id(4)
                .with_arg("num", json!(2)),
        )
    }

    #[test]
    fn test_full_run() {
        let mut h = Harness::new(SpecWriterConfig::default());
        h.send(start());
        h.send(descriptor("d1", "primary", &["a", "b", "c"]));
        h.send(event("d1", 1, json!({"a": 1, "b": 2.5, "c": "x"})));
        h.send(Document::Stop(StopDoc::success("run-1", 103.0)));

        let lines = h.lines();
        assert_eq!(lines[0], "#S 4  count(num=2)");
        assert!(lines[1].starts_with("#D "));
        assert!(lines.contains(&"#N 3".to_string()));
        assert!(lines.contains(&"#L a  b  c".to_string()));
        assert!(lines.contains(&"1 2.5 x".to_string()));
        assert!(lines.iter().any(|l| l.ends_with("num_events_primary = 1")));
        assert!(lines.iter().any(|l| l.ends_with("exit_status = success")));
        assert_eq!(lines.last().map(String::as_str), Some(""));
        assert!(h.diagnostics.entries().is_empty());
    }

    #[test]
    #[traced_test]
    fn test_column_mismatch_coerced() {
        let mut h = Harness::new(SpecWriterConfig::default());
        h.send(start());
        h.send(descriptor("d1", "primary", &["a", "b", "c"]));
        h.send(event("d1", 1, json!({"a": 1, "c": 3})));

        assert_eq!(h.diagnostics.count(DiagnosticKind::ColumnMismatch), 1);
        assert_eq!(h.lines().last().unwrap(), "1 nan 3");
        assert!(logs_contain("missing [\"b\"]"));
        assert!(logs_contain("written with declared columns"));
    }

    #[test]
    fn test_column_mismatch_skipped() {
        let mut h = Harness::new(
            SpecWriterConfig::default().with_column_mismatch(ColumnMismatchPolicy::Skip),
        );
        h.send(start());
        h.send(descriptor("d1", "primary", &["a", "b", "c"]));
        h.send(event("d1", 1, json!({"a": 1, "c": 3})));
        h.send(event("d1", 2, json!({"a": 1, "b": 2, "c": 3, "z": 0})));

        assert_eq!(h.diagnostics.count(DiagnosticKind::ColumnMismatch), 2);
        assert_eq!(h.lines().last().unwrap(), "#L a  b  c");
    }

    #[test]
    fn test_event_before_descriptor_is_skipped() {
        let mut h = Harness::new(SpecWriterConfig::default());
        h.send(start());
        let before = h.lines().len();
        h.send(event("d1", 1, json!({"a": 1})));

        assert_eq!(h.diagnostics.count(DiagnosticKind::ProtocolViolation), 1);
        assert_eq!(h.lines().len(), before);
    }

    #[test]
    fn test_side_stream_and_epoch_columns() {
        let mut h = Harness::new(SpecWriterConfig::default().with_epoch_columns(true));
        h.send(start());
        h.send(descriptor("b1", "baseline", &["t1", "t2"]));
        h.send(event("b1", 1, json!({"t1": 20.5, "t2": 21.0})));
        h.send(descriptor("d1", "primary", &["x"]));
        h.send(event("d1", 2, json!({"x": 7})));
        h.send(Document::Stop(StopDoc::success("run-1", 103.0)));

        let lines = h.lines();
        assert!(lines.contains(&"#O0 t1  t2".to_string()));
        assert!(lines.contains(&"#P0 20.5 21.0".to_string()));
        assert!(lines.contains(&"#L Epoch_float  Epoch  x".to_string()));
        assert!(lines.contains(&"2.0 2 7".to_string()));
        assert!(lines.iter().any(|l| l.ends_with("num_events_baseline = 1")));
        assert!(lines.iter().any(|l| l.ends_with("num_events_primary = 1")));
    }

    #[test]
    fn test_side_stream_after_labels_is_one_comment() {
        let mut h = Harness::new(SpecWriterConfig::default());
        h.send(start());
        h.send(descriptor("d1", "primary", &["x"]));
        h.send(event("d1", 1, json!({"x": 7})));
        h.send(descriptor("b1", "baseline", &["t1", "t2"]));
        h.send(event("b1", 2, json!({"t1": 20.5, "t2": 21.0})));
        h.send(event("d1", 3, json!({"x": 8})));

        let lines = h.lines();
        let labels = lines.iter().position(|l| l == "#L x").unwrap();
        let after = &lines[labels + 1..];
        assert_eq!(after.len(), 3);
        assert_eq!(after[0], "7");
        assert!(after[1].starts_with("#C "));
        assert!(after[1].ends_with(".  stream = baseline  seq_num = 2  t1 = 20.5  t2 = 21.0"));
        assert_eq!(after[2], "8");
        assert!(!lines.iter().any(|l| l.starts_with("#O") || l.starts_with("#P")));
    }

    #[test]
    fn test_primary_without_scalar_columns() {
        let mut h = Harness::new(SpecWriterConfig::default());
        h.send(start());
        let mut image = DataKey::array("det:image", vec![4, 4]);
        image.external = Some("FILESTORE:".to_string());
        let doc = DescriptorDoc::new("d1", "run-1", "primary").with_data_key("img", image);
        h.send(Document::Descriptor(doc));
        h.send(event("d1", 1, json!({"img": "datum-0"})));
        h.send(Document::Stop(StopDoc::success("run-1", 103.0)));

        let lines = h.lines();
        let blank = lines.iter().position(String::is_empty).unwrap();
        assert_eq!(blank, lines.len() - 1);
        assert!(!lines.iter().any(|l| l.starts_with("#N") || l.starts_with("#L")));
        assert!(lines.iter().any(|l| l.ends_with("num_events_primary = 1")));
        assert!(h.diagnostics.entries().is_empty());
    }

    #[test]
    fn test_event_page_rows() {
        let mut h = Harness::new(SpecWriterConfig::default());
        h.send(start());
        h.send(descriptor("d1", "primary", &["a"]));
        let page: EventPage = serde_json::from_value(json!({
            "descriptor": "d1",
            "seq_num": [1, 2, 3],
            "time": [101.0, 102.0, 103.0],
            "data": {"a": [0.5, 1.5, 2.5]}
        }))
        .unwrap();
        h.send(Document::EventPage(page));

        let lines = h.lines();
        assert_eq!(lines[lines.len() - 3..].join("|"), "0.5|1.5|2.5");
    }

    #[test]
    fn test_external_references_are_ignored() {
        let mut h = Harness::new(SpecWriterConfig::default());
        h.send(start());
        let before = h.lines();
        h.send(Document::from_parts(&DocumentKind::Resource, json!({"uid": "r"})).unwrap().unwrap());
        h.send(Document::from_parts(&DocumentKind::Datum, json!({"datum_id": "r/0"})).unwrap().unwrap());
        assert_eq!(h.lines(), before);
        assert!(h.diagnostics.entries().is_empty());
    }

    #[test]
    fn test_stop_while_idle_is_violation() {
        let mut h = Harness::new(SpecWriterConfig::default());
        h.send(Document::Stop(StopDoc::success("run-1", 1.0)));
        assert_eq!(h.diagnostics.count(DiagnosticKind::ProtocolViolation), 1);
        assert!(h.lines().is_empty());
    }
}
