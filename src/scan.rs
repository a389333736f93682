//! Scan Record State - per-run bookkeeping for one writer
//!
//! Tracks the run currently being written: its scan number, the descriptors
//! seen so far and their column layouts, and per-stream event counts.
//!
//! # State machine
//!
//! ```text
//!        start              stop
//! Idle ────────▶ Open ────────────▶ Closed
//!                 │  ▲                 │
//!                 └──┘                 │ start
//!          descriptor/event            ▼
//!                                    Open ...
//! ```
//!
//! Any other transition is a protocol violation, returned as
//! [`Violation`] so the caller can report it and skip the document.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// A document that does not fit the current state of the scan record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Violation {
    /// A start arrived before the open run was stopped.
    #[error("start of run '{uid}' while scan {scan_number} (run '{open}') is still open")]
    RunStillOpen {
        /// Uid of the rejected start.
        uid: String,
        /// Scan number of the open run.
        scan_number: u64,
        /// Uid of the open run.
        open: String,
    },

    /// A run-scoped document arrived with no run open.
    #[error("{what} for run '{run_start}' while no run is open")]
    NoOpenRun {
        /// Document kind.
        what: &'static str,
        /// Run the document names.
        run_start: String,
    },

    /// A run-scoped document names a run other than the open one.
    #[error("{what} belongs to run '{run_start}' but run '{open}' is open")]
    OtherRun {
        /// Document kind.
        what: &'static str,
        /// Run the document names.
        run_start: String,
        /// Uid of the open run.
        open: String,
    },

    /// Same descriptor uid seen twice.
    #[error("descriptor '{0}' was already received")]
    DuplicateDescriptor(String),

    /// A second data-stream descriptor with different columns.
    #[error("descriptor '{uid}' declares columns {columns:?} but stream '{stream}' already announced {announced:?}")]
    LayoutConflict {
        /// Uid of the rejected descriptor.
        uid: String,
        /// Data stream name.
        stream: String,
        /// Columns the rejected descriptor declares.
        columns: Vec<String>,
        /// Columns already written on `#L`.
        announced: Vec<String>,
    },

    /// Event with no run open.
    #[error("event for descriptor '{0}' while no run is open")]
    EventWithoutRun(String),

    /// Event of a descriptor that was rejected earlier.
    #[error("event for rejected descriptor '{0}' skipped")]
    RejectedDescriptor(String),

    /// Event whose descriptor was never received.
    #[error("event refers to unknown descriptor '{0}'")]
    UnknownDescriptor(String),
}

/// Lifecycle state of the scan record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// No run has been opened since the last reset.
    Idle,
    /// A run is being written.
    Open,
    /// The last run was closed.
    Closed,
}

/// Column layout of one descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamLayout {
    /// Stream name from the descriptor.
    pub stream: String,
    /// Scalar data keys, in declared order.
    pub columns: Vec<String>,
    /// Declared keys that are not columns (arrays, external references).
    pub ignored: Vec<String>,
}

/// What the writer should do with an accepted descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum DescriptorOutcome {
    /// First descriptor of the data stream; its column labels must be written.
    AnnounceColumns(Vec<String>),
    /// Another descriptor of the data stream with the already-announced layout.
    SharesLayout,
    /// Descriptor of a side stream.
    SideStream,
}

/// The run currently being written.
#[derive(Debug)]
pub struct OpenRun {
    /// Start document uid.
    pub uid: String,
    /// Number written on the `#S` line.
    pub scan_number: u64,
    /// Start document time, epoch seconds.
    pub start_time: f64,
    descriptors: HashMap<String, StreamLayout>,
    rejected: HashSet<String>,
    data_columns: Option<Vec<String>>,
    data_section: bool,
    event_counts: Vec<(String, u64)>,
}

impl OpenRun {
    fn count_mut(&mut self, stream: &str) -> &mut u64 {
        let index = match self.event_counts.iter().position(|(name, _)| name == stream) {
            Some(index) => index,
            None => {
                self.event_counts.push((stream.to_string(), 0));
                self.event_counts.len() - 1
            }
        };
        &mut self.event_counts[index].1
    }
}

/// Summary of a run that has been closed.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedRun {
    /// Start document uid.
    pub uid: String,
    /// Number the scan was written under.
    pub scan_number: u64,
    /// Events written per stream, in order of each stream's first descriptor.
    pub event_counts: Vec<(String, u64)>,
}

/// Scan numbering and the open run, owned by exactly one writer.
#[derive(Debug)]
pub struct ScanRecord {
    state: ScanState,
    last_scan_number: u64,
    run: Option<OpenRun>,
}

impl Default for ScanRecord {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ScanRecord {
    /// New record whose first assigned number is greater than `last_scan_number`.
    pub fn new(last_scan_number: u64) -> Self {
        Self {
            state: ScanState::Idle,
            last_scan_number,
            run: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Most recently assigned scan number.
    pub fn last_scan_number(&self) -> u64 {
        self.last_scan_number
    }

    /// The open run, if any.
    pub fn run(&self) -> Option<&OpenRun> {
        self.run.as_ref()
    }

    /// Forget any open run and restart numbering after `last_scan_number`.
    pub fn reset(&mut self, last_scan_number: u64) {
        if let Some(run) = self.run.take() {
            tracing::warn!(run = %run.uid, scan = run.scan_number, "Discarding open run on reset");
        }
        *self = Self::new(last_scan_number);
    }

    /// `Idle`/`Closed` → `Open`. Returns the assigned scan number.
    ///
    /// The run's own `scan_id` is kept when it is greater than the last
    /// assigned number; otherwise numbering continues from the last one.
    pub fn open(&mut self, uid: &str, scan_id: Option<i64>, start_time: f64) -> Result<u64, Violation> {
        if let Some(run) = &self.run {
            return Err(Violation::RunStillOpen {
                uid: uid.to_string(),
                scan_number: run.scan_number,
                open: run.uid.clone(),
            });
        }
        let requested = scan_id.and_then(|id| u64::try_from(id).ok());
        let scan_number = match requested {
            Some(id) if id > self.last_scan_number => id,
            _ => self.last_scan_number + 1,
        };
        self.last_scan_number = scan_number;
        self.run = Some(OpenRun {
            uid: uid.to_string(),
            scan_number,
            start_time,
            descriptors: HashMap::new(),
            rejected: HashSet::new(),
            data_columns: None,
            data_section: false,
            event_counts: Vec::new(),
        });
        self.state = ScanState::Open;
        Ok(scan_number)
    }

    /// Register a descriptor of the open run.
    pub fn add_descriptor(
        &mut self,
        uid: &str,
        run_start: &str,
        layout: StreamLayout,
        data_stream: &str,
    ) -> Result<DescriptorOutcome, Violation> {
        let run = self.open_run_for(run_start, "descriptor")?;
        if run.descriptors.contains_key(uid) || run.rejected.contains(uid) {
            return Err(Violation::DuplicateDescriptor(uid.to_string()));
        }
        // keep the stream's position in the footer even if it never gets an event
        run.count_mut(&layout.stream);

        let outcome = if layout.stream != data_stream {
            DescriptorOutcome::SideStream
        } else {
            match &run.data_columns {
                None => {
                    run.data_columns = Some(layout.columns.clone());
                    DescriptorOutcome::AnnounceColumns(layout.columns.clone())
                }
                Some(announced) if *announced == layout.columns => DescriptorOutcome::SharesLayout,
                Some(announced) => {
                    run.rejected.insert(uid.to_string());
                    return Err(Violation::LayoutConflict {
                        uid: uid.to_string(),
                        stream: layout.stream,
                        columns: layout.columns,
                        announced: announced.clone(),
                    });
                }
            }
        };
        run.descriptors.insert(uid.to_string(), layout);
        Ok(outcome)
    }

    /// Layout of the descriptor an event refers to.
    pub fn layout_for(&self, descriptor_uid: &str) -> Result<&StreamLayout, Violation> {
        let run = self
            .run
            .as_ref()
            .ok_or_else(|| Violation::EventWithoutRun(descriptor_uid.to_string()))?;
        if run.rejected.contains(descriptor_uid) {
            return Err(Violation::RejectedDescriptor(descriptor_uid.to_string()));
        }
        run.descriptors
            .get(descriptor_uid)
            .ok_or_else(|| Violation::UnknownDescriptor(descriptor_uid.to_string()))
    }

    /// Count one written event of `stream`.
    pub fn record_event(&mut self, stream: &str) {
        if let Some(run) = self.run.as_mut() {
            *run.count_mut(stream) += 1;
        }
    }

    /// Mark that `#L` has been written for the open run.
    pub fn begin_data_section(&mut self) {
        if let Some(run) = self.run.as_mut() {
            run.data_section = true;
        }
    }

    /// Whether the open run's column labels have been written.
    pub fn in_data_section(&self) -> bool {
        self.run.as_ref().is_some_and(|run| run.data_section)
    }

    /// `Open` → `Closed`.
    pub fn close(&mut self, run_start: &str) -> Result<ClosedRun, Violation> {
        self.open_run_for(run_start, "stop")?;
        let run = self.run.take().ok_or_else(|| Violation::NoOpenRun {
            what: "stop",
            run_start: run_start.to_string(),
        })?;
        self.state = ScanState::Closed;
        Ok(ClosedRun {
            uid: run.uid,
            scan_number: run.scan_number,
            event_counts: run.event_counts,
        })
    }

    fn open_run_for(&mut self, run_start: &str, what: &'static str) -> Result<&mut OpenRun, Violation> {
        let run = self.run.as_mut().ok_or_else(|| Violation::NoOpenRun {
            what,
            run_start: run_start.to_string(),
        })?;
        if run.uid != run_start {
            return Err(Violation::OtherRun {
                what,
                run_start: run_start.to_string(),
                open: run.uid.clone(),
            });
        }
        Ok(run)
    }
}

/// Difference between declared columns and the keys an event carries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnCheck {
    /// Declared columns the event lacks.
    pub missing: Vec<String>,
    /// Event keys that are neither columns nor ignored keys.
    pub extra: Vec<String>,
}

impl ColumnCheck {
    /// Columns absent from `data`, and keys the descriptor never declared.
    pub fn compare(layout: &StreamLayout, data: &Map<String, Value>) -> Self {
        let missing = layout
            .columns
            .iter()
            .filter(|name| !data.contains_key(name.as_str()))
            .cloned()
            .collect();
        let extra = data
            .keys()
            .filter(|key| !layout.columns.contains(key) && !layout.ignored.contains(key))
            .cloned()
            .collect();
        Self { missing, extra }
    }

    /// True when nothing is missing or extra.
    pub fn is_match(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn layout(stream: &str, columns: &[&str]) -> StreamLayout {
        StreamLayout {
            stream: stream.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            ignored: Vec::new(),
        }
    }

    #[test]
    fn test_scan_numbers_strictly_increase() {
        let mut record = ScanRecord::default();
        assert_eq!(record.state(), ScanState::Idle);

        assert_eq!(record.open("a", None, 0.0).unwrap(), 1);
        record.close("a").unwrap();
        assert_eq!(record.state(), ScanState::Closed);

        // run's own id is kept when it moves forward
        assert_eq!(record.open("b", Some(287), 0.0).unwrap(), 287);
        record.close("b").unwrap();

        // repeated or smaller ids continue the sequence
        assert_eq!(record.open("c", Some(287), 0.0).unwrap(), 288);
        record.close("c").unwrap();
        assert_eq!(record.open("d", Some(3), 0.0).unwrap(), 289);
        record.close("d").unwrap();
        assert_eq!(record.open("e", Some(-4), 0.0).unwrap(), 290);
    }

    #[test]
    fn test_start_while_open_is_violation() {
        let mut record = ScanRecord::default();
        record.open("a", None, 0.0).unwrap();
        let err = record.open("b", None, 0.0).unwrap_err();
        assert_eq!(
            err,
            Violation::RunStillOpen {
                uid: "b".into(),
                scan_number: 1,
                open: "a".into(),
            }
        );
        assert!(err.to_string().contains("still open"));
        assert_eq!(record.run().unwrap().uid, "a");
        assert_eq!(record.last_scan_number(), 1);
    }

    #[test]
    fn test_documents_while_idle_are_violations() {
        let mut record = ScanRecord::default();
        assert!(record
            .add_descriptor("d", "a", layout("primary", &["x"]), "primary")
            .is_err());
        assert_eq!(
            record.layout_for("d").unwrap_err(),
            Violation::EventWithoutRun("d".into())
        );
        assert!(matches!(
            record.close("a").unwrap_err(),
            Violation::NoOpenRun { what: "stop", .. }
        ));
    }

    #[test]
    fn test_descriptor_outcomes() {
        let mut record = ScanRecord::default();
        record.open("a", None, 0.0).unwrap();

        assert_eq!(
            record
                .add_descriptor("d1", "a", layout("primary", &["x", "y"]), "primary")
                .unwrap(),
            DescriptorOutcome::AnnounceColumns(vec!["x".into(), "y".into()])
        );
        assert_eq!(
            record
                .add_descriptor("d2", "a", layout("baseline", &["t"]), "primary")
                .unwrap(),
            DescriptorOutcome::SideStream
        );
        assert_eq!(
            record
                .add_descriptor("d3", "a", layout("primary", &["x", "y"]), "primary")
                .unwrap(),
            DescriptorOutcome::SharesLayout
        );

        let err = record
            .add_descriptor("d4", "a", layout("primary", &["x"]), "primary")
            .unwrap_err();
        assert!(matches!(err, Violation::LayoutConflict { .. }));
        assert!(err.to_string().contains("already announced"));
        assert_eq!(
            record.layout_for("d4").unwrap_err(),
            Violation::RejectedDescriptor("d4".into())
        );

        assert_eq!(
            record
                .add_descriptor("d1", "a", layout("primary", &["x", "y"]), "primary")
                .unwrap_err(),
            Violation::DuplicateDescriptor("d1".into())
        );
    }

    #[test]
    fn test_descriptor_for_other_run_is_violation() {
        let mut record = ScanRecord::default();
        record.open("a", None, 0.0).unwrap();
        let err = record
            .add_descriptor("d1", "zzz", layout("primary", &["x"]), "primary")
            .unwrap_err();
        assert!(err.to_string().contains("'zzz'"));
        assert!(matches!(err, Violation::OtherRun { what: "descriptor", .. }));
        assert!(record.close("zzz").is_err());
        assert_eq!(record.state(), ScanState::Open);
    }

    #[test]
    fn test_event_counts_in_stream_order() {
        let mut record = ScanRecord::default();
        record.open("a", None, 0.0).unwrap();
        record
            .add_descriptor("b1", "a", layout("baseline", &["t"]), "primary")
            .unwrap();
        record
            .add_descriptor("p1", "a", layout("primary", &["x"]), "primary")
            .unwrap();
        record.record_event("primary");
        record.record_event("primary");
        record.record_event("baseline");

        let closed = record.close("a").unwrap();
        assert_eq!(
            closed.event_counts,
            vec![("baseline".to_string(), 1), ("primary".to_string(), 2)]
        );
    }

    #[test]
    fn test_data_section_is_per_run() {
        let mut record = ScanRecord::default();
        record.begin_data_section();
        assert!(!record.in_data_section());

        record.open("a", None, 0.0).unwrap();
        assert!(!record.in_data_section());
        record.begin_data_section();
        assert!(record.in_data_section());
        record.close("a").unwrap();
        assert!(!record.in_data_section());

        record.open("b", None, 0.0).unwrap();
        assert!(!record.in_data_section());
    }

    #[test]
    fn test_reset_restarts_numbering() {
        let mut record = ScanRecord::default();
        record.open("a", Some(50), 0.0).unwrap();
        record.reset(0);
        assert_eq!(record.state(), ScanState::Idle);
        assert_eq!(record.open("b", None, 0.0).unwrap(), 1);
    }

    #[test]
    fn test_column_check() {
        let mut declared = layout("primary", &["a", "b", "c"]);
        declared.ignored.push("image".to_string());
        let full = json!({"a": 1, "b": 2, "c": 3, "image": "datum-0"});
        assert!(ColumnCheck::compare(&declared, full.as_object().unwrap()).is_match());

        let partial = json!({"a": 1, "c": 3, "z": 0});
        let check = ColumnCheck::compare(&declared, partial.as_object().unwrap());
        assert_eq!(check.missing, vec!["b"]);
        assert_eq!(check.extra, vec!["z"]);
        assert!(!check.is_match());
    }
}
