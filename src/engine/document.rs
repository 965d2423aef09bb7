//! Document model for scan runs.
//!
//! The run engine reports what happened as a stream of documents:
//!
//! - **StartDoc**: plan name and the metadata passed to `open_run`
//! - **DescriptorDoc**: the fields recorded by a run's events, with units
//! - **EventDoc**: the values read for one saved point
//! - **StopDoc**: exit status and event count
//!
//! # Document Flow
//!
//! ```text
//! StartDoc (1)
//!    │
//!    ├── DescriptorDoc (0..1, created by the first save)
//!    │       │
//!    │       └── EventDoc (N, one per save)
//!    │
//! StopDoc (1)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Document types emitted by the run engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    /// Start of a run.
    Start(StartDoc),
    /// Schema of the run's events.
    Descriptor(DescriptorDoc),
    /// One saved point.
    Event(EventDoc),
    /// End of a run.
    Stop(StopDoc),
}

impl Document {
    /// Get the document UID
    pub fn uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.uid,
            Document::Event(d) => &d.uid,
            Document::Stop(d) => &d.uid,
        }
    }

    /// Get the run UID this document belongs to
    pub fn run_uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid, // Start doc UID is the run UID
            Document::Descriptor(d) => &d.run_uid,
            Document::Event(d) => &d.run_uid,
            Document::Stop(d) => &d.run_uid,
        }
    }

    /// Time the document was created
    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Document::Start(d) => d.time,
            Document::Descriptor(d) => d.time,
            Document::Event(d) => d.time,
            Document::Stop(d) => d.time,
        }
    }

    /// The start document, if this is one
    pub fn as_start(&self) -> Option<&StartDoc> {
        match self {
            Document::Start(d) => Some(d),
            _ => None,
        }
    }

    /// The event document, if this is one
    pub fn as_event(&self) -> Option<&EventDoc> {
        match self {
            Document::Event(d) => Some(d),
            _ => None,
        }
    }

    /// The stop document, if this is one
    pub fn as_stop(&self) -> Option<&StopDoc> {
        match self {
            Document::Stop(d) => Some(d),
            _ => None,
        }
    }
}

/// Start document - emitted by `open_run`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartDoc {
    /// Unique run identifier (this IS the run_uid)
    pub uid: String,
    /// Plan that opened the run, from the `plan_name` metadata key
    pub plan_name: Option<String>,
    /// Metadata passed to `open_run`, unchanged
    pub metadata: Map<String, Value>,
    /// Timestamp when run started
    pub time: DateTime<Utc>,
}

impl StartDoc {
    /// Create a start document from `open_run` metadata.
    pub fn new(metadata: Map<String, Value>) -> Self {
        let plan_name = metadata
            .get("plan_name")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            uid: new_uid(),
            plan_name,
            metadata,
            time: Utc::now(),
        }
    }
}

/// Descriptor document - defines the fields of a run's events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorDoc {
    /// Unique descriptor ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Stream name
    pub name: String,
    /// Schema for data fields
    pub data_keys: BTreeMap<String, DataKey>,
    /// Timestamp
    pub time: DateTime<Utc>,
}

impl DescriptorDoc {
    /// Create an empty descriptor for a stream.
    pub fn new(run_uid: &str, name: &str) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            name: name.to_string(),
            data_keys: BTreeMap::new(),
            time: Utc::now(),
        }
    }

    /// Add a field.
    pub fn with_data_key(mut self, name: &str, key: DataKey) -> Self {
        self.data_keys.insert(name.to_string(), key);
        self
    }
}

/// Schema for a data field within events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Data type, always "number" for signal reads
    pub dtype: String,
    /// Source signal name
    pub source: String,
    /// Physical units, if the signal declares them
    pub units: Option<String>,
}

impl DataKey {
    /// Create a scalar number data key
    pub fn scalar(source: &str, units: Option<&str>) -> Self {
        Self {
            dtype: "number".to_string(),
            source: source.to_string(),
            units: units.map(str::to_string),
        }
    }
}

/// Event document - values read for one saved point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDoc {
    /// Unique event ID
    pub uid: String,
    /// Links to StartDoc (for quick run lookup)
    pub run_uid: String,
    /// Links to DescriptorDoc that defines schema
    pub descriptor_uid: String,
    /// Event sequence number within the run, starting at 1
    pub seq_num: u32,
    /// Timestamp
    pub time: DateTime<Utc>,
    /// Values read (field name -> value)
    pub data: BTreeMap<String, f64>,
    /// Per-field read times
    pub timestamps: BTreeMap<String, DateTime<Utc>>,
}

impl EventDoc {
    /// Create an empty event.
    pub fn new(run_uid: &str, descriptor_uid: &str, seq_num: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            descriptor_uid: descriptor_uid.to_string(),
            seq_num,
            time: Utc::now(),
            data: BTreeMap::new(),
            timestamps: BTreeMap::new(),
        }
    }

    /// Add a value read at `time`.
    pub fn with_datum(mut self, field: &str, value: f64, time: DateTime<Utc>) -> Self {
        self.data.insert(field.to_string(), value);
        self.timestamps.insert(field.to_string(), time);
        self
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// `close_run` was executed.
    Success,
    /// The plan ended without closing the run.
    Abort,
    /// A message failed while the run was open.
    Fail,
}

/// Stop document - emitted at the end of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopDoc {
    /// Unique stop doc ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Exit status
    pub exit_status: ExitStatus,
    /// Reason for abort/failure
    pub reason: String,
    /// Timestamp when run ended
    pub time: DateTime<Utc>,
    /// Total events emitted
    pub num_events: u32,
}

impl StopDoc {
    fn with_status(run_uid: &str, exit_status: ExitStatus, reason: &str, num_events: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            exit_status,
            reason: reason.to_string(),
            time: Utc::now(),
            num_events,
        }
    }

    /// Run closed normally.
    pub fn success(run_uid: &str, num_events: u32) -> Self {
        Self::with_status(run_uid, ExitStatus::Success, "", num_events)
    }

    /// Run left open by the plan.
    pub fn abort(run_uid: &str, reason: &str, num_events: u32) -> Self {
        Self::with_status(run_uid, ExitStatus::Abort, reason, num_events)
    }

    /// Run interrupted by an error.
    pub fn fail(run_uid: &str, reason: &str, num_events: u32) -> Self {
        Self::with_status(run_uid, ExitStatus::Fail, reason, num_events)
    }
}
