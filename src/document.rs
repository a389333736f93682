//! Document model for run streams
//!
//! A run is described by a sequence of documents delivered in acquisition
//! order. Each arrives as a `(kind, body)` pair; the body is a JSON mapping
//! that deserializes into one of the typed documents below.
//!
//! # Document Flow
//!
//! ```text
//! StartDoc (1)
//!    │
//!    ├── DescriptorDoc (1+, one per data stream)
//!    │       │
//!    │       └── EventDoc / EventPage (N, measurements)
//!    │
//!    ├── resource / datum (ignored, external data references)
//!    │
//! StopDoc (1)
//! ```
//!
//! All mappings keep their document order (`serde_json` is built with
//! `preserve_order`), so declared column order survives deserialization.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Document kinds the writer distinguishes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    /// Opens a run.
    Start,
    /// Declares one stream's data keys.
    Descriptor,
    /// One reading of a stream.
    Event,
    /// Column-packed batch of events.
    EventPage,
    /// Closes a run.
    Stop,
    /// External file reference.
    Resource,
    /// Pointer into a resource.
    Datum,
    /// Batch of datums.
    DatumPage,
    /// Any kind outside the known set, by name.
    Unknown(String),
}

impl DocumentKind {
    /// Kind for a wire name; names outside the known set become `Unknown`.
    pub fn parse(name: &str) -> Self {
        match name {
            "start" => DocumentKind::Start,
            "descriptor" => DocumentKind::Descriptor,
            "event" => DocumentKind::Event,
            "event_page" => DocumentKind::EventPage,
            "stop" => DocumentKind::Stop,
            "resource" => DocumentKind::Resource,
            "datum" => DocumentKind::Datum,
            "datum_page" => DocumentKind::DatumPage,
            other => DocumentKind::Unknown(other.to_string()),
        }
    }

    /// Wire name.
    pub fn as_str(&self) -> &str {
        match self {
            DocumentKind::Start => "start",
            DocumentKind::Descriptor => "descriptor",
            DocumentKind::Event => "event",
            DocumentKind::EventPage => "event_page",
            DocumentKind::Stop => "stop",
            DocumentKind::Resource => "resource",
            DocumentKind::Datum => "datum",
            DocumentKind::DatumPage => "datum_page",
            DocumentKind::Unknown(name) => name,
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed document of a known kind.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum Document {
    Start(StartDoc),
    Descriptor(DescriptorDoc),
    Event(EventDoc),
    EventPage(EventPage),
    Stop(StopDoc),
    /// External data references; carried but never rendered.
    Resource(Value),
    Datum(Value),
    DatumPage(Value),
}

impl Document {
    /// Interpret a document body of a known kind.
    ///
    /// Returns `None` for [`DocumentKind::Unknown`].
    pub fn from_parts(kind: &DocumentKind, body: Value) -> Option<Result<Self, serde_json::Error>> {
        let doc = match kind {
            DocumentKind::Start => serde_json::from_value(body).map(Document::Start),
            DocumentKind::Descriptor => serde_json::from_value(body).map(Document::Descriptor),
            DocumentKind::Event => serde_json::from_value(body).map(Document::Event),
            DocumentKind::EventPage => serde_json::from_value(body).map(Document::EventPage),
            DocumentKind::Stop => serde_json::from_value(body).map(Document::Stop),
            DocumentKind::Resource => Ok(Document::Resource(body)),
            DocumentKind::Datum => Ok(Document::Datum(body)),
            DocumentKind::DatumPage => Ok(Document::DatumPage(body)),
            DocumentKind::Unknown(_) => return None,
        };
        Some(doc)
    }

    /// Kind of this document.
    pub fn kind(&self) -> DocumentKind {
        match self {
            Document::Start(_) => DocumentKind::Start,
            Document::Descriptor(_) => DocumentKind::Descriptor,
            Document::Event(_) => DocumentKind::Event,
            Document::EventPage(_) => DocumentKind::EventPage,
            Document::Stop(_) => DocumentKind::Stop,
            Document::Resource(_) => DocumentKind::Resource,
            Document::Datum(_) => DocumentKind::Datum,
            Document::DatumPage(_) => DocumentKind::DatumPage,
        }
    }
}

/// Start document - emitted at the beginning of a run
///
/// Every key not named here is user metadata and lands in `metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDoc {
    /// Unique run identifier
    pub uid: String,
    /// Seconds since the Unix epoch
    pub time: f64,
    /// Requested scan number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<i64>,
    /// Plan name, the command on `#S`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_name: Option<String>,
    /// Plan type (e.g., "generator")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_type: Option<String>,
    /// Named plan arguments, in the order the plan declared them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_args: Option<Map<String, Value>>,
    /// Detector names, substituted for the `detectors` argument
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detectors: Option<Value>,
    /// Motor names, substituted for `motor*` arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motors: Option<Value>,
    /// All other keys
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl StartDoc {
    /// Start document with no plan and no metadata.
    pub fn new(uid: &str, time: f64) -> Self {
        Self {
            uid: uid.to_string(),
            time,
            scan_id: None,
            plan_name: None,
            plan_type: None,
            plan_args: None,
            detectors: None,
            motors: None,
            metadata: Map::new(),
        }
    }

    /// Set plan name and type.
    pub fn with_plan(mut self, plan_name: &str, plan_type: &str) -> Self {
        self.plan_name = Some(plan_name.to_string());
        self.plan_type = Some(plan_type.to_string());
        self
    }

    /// Set the requested scan number.
    pub fn with_scan_id(mut self, scan_id: i64) -> Self {
        self.scan_id = Some(scan_id);
        self
    }

    /// Append a plan argument.
    pub fn with_arg(mut self, key: &str, value: Value) -> Self {
        self.plan_args
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value);
        self
    }

    /// Add a metadata key.
    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Descriptor document - defines the schema for one event stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorDoc {
    /// Unique descriptor identifier
    pub uid: String,
    /// Links to StartDoc
    pub run_start: String,
    /// Stream name (e.g., "primary", "baseline")
    #[serde(default = "default_stream_name")]
    pub name: String,
    /// Schema for data fields, in declared order
    #[serde(default)]
    pub data_keys: Map<String, Value>,
    /// Seconds since the Unix epoch
    #[serde(default)]
    pub time: f64,
}

fn default_stream_name() -> String {
    "primary".to_string()
}

impl DescriptorDoc {
    /// Descriptor with no data keys.
    pub fn new(uid: &str, run_start: &str, name: &str) -> Self {
        Self {
            uid: uid.to_string(),
            run_start: run_start.to_string(),
            name: name.to_string(),
            data_keys: Map::new(),
            time: 0.0,
        }
    }

    /// Append a data key.
    pub fn with_data_key(mut self, name: &str, key: DataKey) -> Self {
        let value = serde_json::to_value(key).unwrap_or(Value::Null);
        self.data_keys.insert(name.to_string(), value);
        self
    }

    /// Declared data keys, in order.
    pub fn data_keys(&self) -> Result<Vec<(String, DataKey)>, serde_json::Error> {
        self.data_keys
            .iter()
            .map(|(name, value)| DataKey::deserialize(value).map(|key| (name.clone(), key)))
            .collect()
    }

    /// Names of the keys that become table columns: scalars stored inline.
    pub fn columns(&self) -> Result<Vec<String>, serde_json::Error> {
        Ok(self
            .data_keys()?
            .into_iter()
            .filter(|(_, key)| key.is_scalar())
            .map(|(name, _)| name)
            .collect())
    }
}

/// Schema for a data field within events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataKey {
    /// Data type: "number", "integer", "string", "boolean", "array"
    #[serde(default = "default_dtype")]
    pub dtype: String,
    /// Shape for arrays (empty for scalars)
    #[serde(default)]
    pub shape: Vec<i64>,
    /// Device or signal the value comes from
    #[serde(default)]
    pub source: String,
    /// Engineering units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Set when the value lives in external storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
}

fn default_dtype() -> String {
    "number".to_string()
}

impl DataKey {
    /// Create a scalar number data key
    pub fn scalar(source: &str) -> Self {
        Self {
            dtype: default_dtype(),
            shape: vec![],
            source: source.to_string(),
            units: None,
            external: None,
        }
    }

    /// Create an array data key
    pub fn array(source: &str, shape: Vec<i64>) -> Self {
        Self {
            dtype: "array".to_string(),
            shape,
            source: source.to_string(),
            units: None,
            external: None,
        }
    }

    /// Set units.
    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    /// Inline value with no shape; the only kind written as a column.
    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty() && self.external.is_none()
    }
}

/// Event document - one row of measurements
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDoc {
    /// Unique event identifier
    #[serde(default)]
    pub uid: String,
    /// Links to DescriptorDoc
    pub descriptor: String,
    /// Position within the stream, starting at 1
    #[serde(default)]
    pub seq_num: i64,
    /// Seconds since the Unix epoch
    pub time: f64,
    /// Readings keyed by data key
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Per-reading timestamps
    #[serde(default)]
    pub timestamps: Map<String, Value>,
}

impl EventDoc {
    /// Event with no readings.
    pub fn new(descriptor: &str, seq_num: i64, time: f64) -> Self {
        Self {
            uid: String::new(),
            descriptor: descriptor.to_string(),
            seq_num,
            time,
            data: Map::new(),
            timestamps: Map::new(),
        }
    }

    /// Add a reading, timestamped with the event time.
    pub fn with_datum(mut self, field: &str, value: Value) -> Self {
        self.timestamps.insert(field.to_string(), Value::from(self.time));
        self.data.insert(field.to_string(), value);
        self
    }
}

/// Why an event page could not be unpacked.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventPageError {
    /// `time`, `seq_num` and `uid` have different lengths.
    #[error("event page lengths disagree: time={time}, seq_num={seq_num}, uid={uid}")]
    LengthMismatch {
        /// Length of `time`.
        time: usize,
        /// Length of `seq_num`.
        seq_num: usize,
        /// Length of `uid` (0 when absent).
        uid: usize,
    },

    /// A `data` or `timestamps` column has the wrong length.
    #[error("{field} column '{key}' has {found} values, expected {expected}")]
    ColumnLength {
        /// `data` or `timestamps`.
        field: &'static str,
        /// Column name.
        key: String,
        /// Values in the column.
        found: usize,
        /// Page length.
        expected: usize,
    },

    /// A `data` or `timestamps` column is not a list.
    #[error("{field} column '{key}' is not a list")]
    NotAList {
        /// `data` or `timestamps`.
        field: &'static str,
        /// Column name.
        key: String,
    },
}

/// Column-packed batch of events sharing one descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPage {
    /// Links to DescriptorDoc
    pub descriptor: String,
    /// Event uids, or empty
    #[serde(default)]
    pub uid: Vec<String>,
    /// Sequence numbers, one per event
    pub seq_num: Vec<i64>,
    /// Event times, one per event
    pub time: Vec<f64>,
    /// One list per data key
    #[serde(default)]
    pub data: Map<String, Value>,
    /// One list per data key
    #[serde(default)]
    pub timestamps: Map<String, Value>,
}

impl EventPage {
    /// Unpack into individual events, in page order.
    ///
    /// Fails when a column's length disagrees with the page length.
    pub fn into_events(self) -> Result<Vec<EventDoc>, EventPageError> {
        let len = self.time.len();
        if self.seq_num.len() != len || (!self.uid.is_empty() && self.uid.len() != len) {
            return Err(EventPageError::LengthMismatch {
                time: len,
                seq_num: self.seq_num.len(),
                uid: self.uid.len(),
            });
        }
        let data = unpack_columns(&self.data, len, "data")?;
        let timestamps = unpack_columns(&self.timestamps, len, "timestamps")?;

        let mut events = Vec::with_capacity(len);
        for i in 0..len {
            events.push(EventDoc {
                uid: self.uid.get(i).cloned().unwrap_or_default(),
                descriptor: self.descriptor.clone(),
                seq_num: self.seq_num[i],
                time: self.time[i],
                data: row_of(&data, i),
                timestamps: row_of(&timestamps, i),
            });
        }
        Ok(events)
    }
}

fn unpack_columns<'a>(
    columns: &'a Map<String, Value>,
    len: usize,
    field: &'static str,
) -> Result<Vec<(&'a String, &'a Vec<Value>)>, EventPageError> {
    columns
        .iter()
        .map(|(key, column)| match column {
            Value::Array(values) if values.len() == len => Ok((key, values)),
            Value::Array(values) => Err(EventPageError::ColumnLength {
                field,
                key: key.clone(),
                found: values.len(),
                expected: len,
            }),
            _ => Err(EventPageError::NotAList {
                field,
                key: key.clone(),
            }),
        })
        .collect()
}

fn row_of(columns: &[(&String, &Vec<Value>)], index: usize) -> Map<String, Value> {
    columns
        .iter()
        .map(|(key, values)| ((*key).clone(), values[index].clone()))
        .collect()
}

/// Stop document - emitted at the end of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDoc {
    /// Unique stop identifier
    #[serde(default)]
    pub uid: String,
    /// Links to StartDoc
    pub run_start: String,
    /// Seconds since the Unix epoch
    pub time: f64,
    /// Exit status: "success", "abort", "fail"
    #[serde(default = "default_exit_status")]
    pub exit_status: String,
    /// Reason for abort/failure
    #[serde(default)]
    pub reason: String,
    /// Events per stream as counted by the run engine
    #[serde(default)]
    pub num_events: Map<String, Value>,
}

fn default_exit_status() -> String {
    "success".to_string()
}

impl StopDoc {
    /// Successful stop.
    pub fn success(run_start: &str, time: f64) -> Self {
        Self {
            uid: String::new(),
            run_start: run_start.to_string(),
            time,
            exit_status: default_exit_status(),
            reason: String::new(),
            num_events: Map::new(),
        }
    }

    /// Aborted stop with a reason.
    pub fn abort(run_start: &str, time: f64, reason: &str) -> Self {
        Self {
            exit_status: "abort".to_string(),
            reason: reason.to_string(),
            ..Self::success(run_start, time)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_round_trip_and_unknown() {
        for name in ["start", "descriptor", "event", "event_page", "stop", "resource", "datum"] {
            assert_eq!(DocumentKind::parse(name).as_str(), name);
        }
        assert_eq!(
            DocumentKind::parse("bulk_events"),
            DocumentKind::Unknown("bulk_events".to_string())
        );
    }

    #[test]
    fn test_start_doc_splits_metadata() {
        let body = json!({
            "uid": "run-1",
            "time": 1_600_000_000.5,
            "scan_id": 7,
            "plan_name": "scan",
            "plan_args": {"num": 5, "detectors": ["det"]},
            "detectors": ["det"],
            "operator": "Alice",
            "sample": {"name": "Si"}
        });
        let doc: StartDoc = serde_json::from_value(body).unwrap();

        assert_eq!(doc.scan_id, Some(7));
        assert_eq!(doc.plan_name.as_deref(), Some("scan"));
        let keys: Vec<_> = doc.metadata.keys().cloned().collect();
        assert_eq!(keys, vec!["operator", "sample"]);
    }

    #[test]
    fn test_descriptor_columns_keep_order_and_skip_arrays() {
        let desc = DescriptorDoc::new("d1", "run-1", "primary")
            .with_data_key("m1", DataKey::scalar("SIM:m1").with_units("mm"))
            .with_data_key("image", DataKey::array("cam", vec![512, 512]))
            .with_data_key("det", DataKey::scalar("SIM:det"))
            .with_data_key("I0", DataKey::scalar("SIM:I0"));

        assert_eq!(desc.columns().unwrap(), vec!["m1", "det", "I0"]);
    }

    #[test]
    fn test_external_key_is_not_a_column() {
        let body = json!({
            "uid": "d1",
            "run_start": "run-1",
            "data_keys": {
                "det": {"dtype": "number", "shape": [], "source": "x"},
                "img": {"dtype": "number", "shape": [], "source": "y", "external": "FILESTORE:"}
            }
        });
        let desc: DescriptorDoc = serde_json::from_value(body).unwrap();
        assert_eq!(desc.name, "primary");
        assert_eq!(desc.columns().unwrap(), vec!["det"]);
    }

    #[test]
    fn test_event_page_unpacks_in_order() {
        let page: EventPage = serde_json::from_value(json!({
            "descriptor": "d1",
            "uid": ["e1", "e2"],
            "seq_num": [1, 2],
            "time": [10.0, 11.0],
            "data": {"a": [1.0, 2.0], "b": [3.0, 4.0]},
            "timestamps": {"a": [10.0, 11.0], "b": [10.0, 11.0]}
        }))
        .unwrap();

        let events = page.into_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].uid, "e2");
        assert_eq!(events[1].seq_num, 2);
        assert_eq!(events[1].data.get("b"), Some(&json!(4.0)));
        let keys: Vec<_> = events[0].data.keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_event_page_length_mismatch() {
        let page: EventPage = serde_json::from_value(json!({
            "descriptor": "d1",
            "seq_num": [1, 2],
            "time": [10.0, 11.0],
            "data": {"a": [1.0]}
        }))
        .unwrap();
        let err = page.into_events().unwrap_err();
        assert_eq!(
            err,
            EventPageError::ColumnLength {
                field: "data",
                key: "a".to_string(),
                found: 1,
                expected: 2,
            }
        );
        assert!(err.to_string().contains("'a'"));
    }

    #[test]
    fn test_unknown_kind_has_no_document() {
        let kind = DocumentKind::parse("bulk_datum");
        assert!(Document::from_parts(&kind, json!({})).is_none());
    }

    #[test]
    fn test_stop_defaults() {
        let stop: StopDoc =
            serde_json::from_value(json!({"run_start": "run-1", "time": 5.0})).unwrap();
        assert_eq!(stop.exit_status, "success");
        assert!(stop.reason.is_empty());
    }
}
