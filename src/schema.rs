use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Column / field name used for the per-event timestamp.
///
/// Every accepted event carries one, so it doubles as the default
/// reference column for the master's alignment check.
pub const EVENT_TIME_KEY: &str = "event_time";

/// Run id reported before any run has been observed.
pub const NO_RUN: i64 = -1;

/// A single measurement value.
///
/// The schema is discovered at runtime, so every field is carried as a
/// tagged variant instead of a fixed struct. On the wire the variants are
/// untagged:
///
/// - `3`                               -> `Int`
/// - `3.5`                             -> `Float`
/// - `[1.0, 2.0]`                      -> `Array`
/// - `{"shape":[2,2],"data":[...]}`    -> `Tensor` (row-major)
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Array(Vec<f64>),
    Tensor { shape: Vec<usize>, data: Vec<f64> },
}

/// Shape of a value, used to check that one key stays consistent
/// across all events of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    Scalar,
    Array(usize),
    Tensor(Vec<usize>),
}

impl Value {
    pub fn shape(&self) -> Shape {
        match self {
            Value::Int(_) | Value::Float(_) => Shape::Scalar,
            Value::Array(v) => Shape::Array(v.len()),
            Value::Tensor { shape, .. } => Shape::Tensor(shape.clone()),
        }
    }

    /// False when any number is NaN or infinite; JSON cannot carry them.
    pub fn is_finite(&self) -> bool {
        match self {
            Value::Int(_) => true,
            Value::Float(f) => f.is_finite(),
            Value::Array(v) => v.iter().all(|x| x.is_finite()),
            Value::Tensor { data, .. } => data.iter().all(|x| x.is_finite()),
        }
    }

    /// A tensor's data must fill its shape exactly.
    pub fn is_well_formed(&self) -> bool {
        match self {
            Value::Tensor { shape, data } => {
                shape
                    .iter()
                    .try_fold(1usize, |acc, d| acc.checked_mul(*d))
                    == Some(data.len())
            }
            _ => true,
        }
    }

    /// Numeric view of a scalar value. Arrays and tensors return `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

// ------------------------------------------------------------
// Event time
// ------------------------------------------------------------
//
// Wall-clock pair as produced by the detector readout:
// seconds since the Unix epoch plus nanoseconds.
//
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTime {
    pub seconds: i64,
    pub nanoseconds: u32,
}

impl EventTime {
    pub fn new(seconds: i64, nanoseconds: u32) -> Self {
        Self { seconds, nanoseconds }
    }

    /// Column representation: `[seconds, nanoseconds]`.
    pub fn to_value(self) -> Value {
        Value::Array(vec![self.seconds as f64, self.nanoseconds as f64])
    }

    pub fn as_secs_f64(self) -> f64 {
        self.seconds as f64 + self.nanoseconds as f64 * 1e-9
    }
}

// ------------------------------------------------------------
// Extraction result
// ------------------------------------------------------------
//
// What the extraction collaborator yields for one event.
//
// `fields` may be nested one level (group -> subkey -> value);
// the worker flattens nested entries to "group__subkey".
// `damage` holds one validity indicator per sub-detector.
//
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Field {
    Value(Value),
    Group(BTreeMap<String, Field>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEvent {
    pub event_time: EventTime,

    /// Run the event belongs to, when the source knows it.
    #[serde(default)]
    pub run_id: Option<i64>,

    #[serde(default)]
    pub fields: BTreeMap<String, Field>,

    #[serde(default)]
    pub damage: BTreeMap<String, f64>,
}

// ------------------------------------------------------------
// Batch (scatter wire message)
// ------------------------------------------------------------
//
// The only message a worker sends to the master.
//
// INVARIANT:
// - every `fields` entry has exactly `event_count_sent` values
// - all values of one key share the same shape
//
// The encoder guarantees both before a batch leaves the worker;
// the merger re-checks on arrival.
//
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Run this batch belongs to (best effort, may be stale)
    pub run_id: i64,

    /// Producing worker, diagnostics only
    pub sender_id: u32,

    /// Events examined by this sender since its own last reset
    pub event_count_seen: u64,

    /// Events contained in this batch
    pub event_count_sent: u64,

    /// Wall clock at flush time
    pub send_timestamp: EventTime,

    #[serde(default)]
    pub fields: BTreeMap<String, Vec<Value>>,

    #[serde(default)]
    pub end_of_run: bool,
}

impl Batch {
    /// Builds a data-less batch signalling a run transition.
    pub fn end_of_run(
        run_id: i64,
        sender_id: u32,
        event_count_seen: u64,
        send_timestamp: EventTime,
    ) -> Self {
        Self {
            run_id,
            sender_id,
            event_count_seen,
            event_count_sent: 0,
            send_timestamp,
            fields: BTreeMap::new(),
            end_of_run: true,
        }
    }
}

// ------------------------------------------------------------
// Snapshot (reply wire message)
// ------------------------------------------------------------
//
// Full copy of the master table at request time.
//
// IMPORTANT for consumers:
// - columns are in batch arrival order, not event-time order
// - a key may be missing, or briefly shorter than `event_time`,
//   when a worker dropped it from a batch; this is accepted
//   behaviour, not a defect
//
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub run_id: i64,

    #[serde(default)]
    pub columns: BTreeMap<String, Vec<Value>>,

    #[serde(default)]
    pub batches_merged: u64,

    #[serde(default)]
    pub events_merged: u64,

    pub taken_at: EventTime,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.columns.values().all(|c| c.is_empty())
    }

    /// Length of one column, 0 when the key is absent.
    pub fn len_of(&self, key: &str) -> usize {
        self.columns.get(key).map_or(0, |c| c.len())
    }

    /// Scalar column as `f64`, `None` if absent or not scalar.
    pub fn scalar_column(&self, key: &str) -> Option<Vec<f64>> {
        self.columns
            .get(key)?
            .iter()
            .map(Value::as_f64)
            .collect()
    }
}
