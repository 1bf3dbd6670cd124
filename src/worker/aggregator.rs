use std::collections::BTreeMap;

use crate::config::{DerivedField, ForwardConfig, GateRule, WorkerConfig};
use crate::encoder::{self, BatchHeader};
use crate::error::SkipReason;
use crate::metrics::{self, METRICS};
use crate::schema::{Batch, EVENT_TIME_KEY, ExtractedEvent, Field, NO_RUN, Value};
use crate::util;

/// Result of offering one event to the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Fields were appended to the buffers
    Accepted,

    /// A gate rule rejected the event; this is sampling, not an error
    Gated { detector: String },
}

/// Per-worker accumulation state.
///
/// Owns one growable buffer per measurement key until a flush moves
/// them into a `Batch`. Counters restart whenever the worker moves to
/// a new run.
///
/// INVARIANT:
/// - `pending` equals the length of the `event_time` buffer
/// - other buffers may be shorter when a key was missing from some
///   events; such keys are dropped at flush by the encoder
pub struct WorkerAggregator {
    sender_id: u32,
    batch_size: usize,
    forward: ForwardConfig,
    gating: Vec<GateRule>,
    derived: Vec<DerivedField>,

    run_id: i64,
    events_seen: u64,
    pending: usize,
    buffers: BTreeMap<String, Vec<Value>>,
}

impl WorkerAggregator {
    pub fn new(sender_id: u32, batch_size: usize) -> Self {
        Self {
            sender_id,
            batch_size: batch_size.max(1),
            forward: ForwardConfig::default(),
            gating: Vec::new(),
            derived: Vec::new(),
            run_id: NO_RUN,
            events_seen: 0,
            pending: 0,
            buffers: BTreeMap::new(),
        }
    }

    pub fn from_config(cfg: &WorkerConfig) -> Self {
        Self::new(cfg.sender_id, cfg.batch_size)
            .with_forward(cfg.forward.clone())
            .with_gating(cfg.gating.clone())
            .with_derived(cfg.derived.clone())
    }

    pub fn with_forward(mut self, forward: ForwardConfig) -> Self {
        self.forward = forward;
        self
    }

    pub fn with_gating(mut self, gating: Vec<GateRule>) -> Self {
        self.gating = gating;
        self
    }

    pub fn with_derived(mut self, derived: Vec<DerivedField>) -> Self {
        self.derived = derived;
        self
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn events_seen(&self) -> u64 {
        self.events_seen
    }

    /// Accepted events waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Compares the run an event claims to belong to with ours.
    ///
    /// Returns the new run id when this is a transition the master
    /// must hear about. The first run ever seen is adopted silently.
    pub fn observe_run(&mut self, run_id: Option<i64>) -> Option<i64> {
        let run_id = run_id?;
        if self.run_id == NO_RUN {
            self.run_id = run_id;
            return None;
        }
        (run_id != self.run_id).then_some(run_id)
    }

    /// Counts an event the source could not deliver.
    pub fn skip(&mut self, reason: &SkipReason) {
        self.events_seen += 1;
        log::debug!("sender {} skipped event: {}", self.sender_id, reason);
    }

    /// Gates one event and appends its forwarded fields.
    pub fn ingest(&mut self, event: ExtractedEvent) -> IngestOutcome {
        self.events_seen += 1;

        if let Err(detector) = self.gate(&event.damage) {
            log::trace!("sender {} gated event on {}", self.sender_id, detector);
            return IngestOutcome::Gated { detector };
        }

        let flat = flatten(event.fields);

        for derived in &self.derived {
            let value = derived.compute(&flat).unwrap_or_else(|reason| {
                log::trace!("derived {} falls back to default: {}", derived.name, reason);
                derived.default
            });
            self.buffers
                .entry(derived.name.clone())
                .or_default()
                .push(Value::Float(value));
        }

        for (key, value) in flat {
            if key == EVENT_TIME_KEY || !self.forwards(&key) {
                continue;
            }
            if self.derived.iter().any(|d| d.name == key) {
                continue;
            }
            self.buffers.entry(key).or_default().push(value);
        }

        self.buffers
            .entry(EVENT_TIME_KEY.to_string())
            .or_default()
            .push(event.event_time.to_value());

        self.pending += 1;
        IngestOutcome::Accepted
    }

    /// Flushes once `batch_size` accepted events are buffered.
    pub fn flush_if_due(&mut self) -> Option<Batch> {
        if self.pending >= self.batch_size {
            self.flush()
        } else {
            None
        }
    }

    /// Encodes everything buffered into one batch and clears buffers.
    ///
    /// Returns `None` when nothing is pending.
    pub fn flush(&mut self) -> Option<Batch> {
        if self.pending == 0 {
            self.buffers.clear();
            return None;
        }

        let buffers = std::mem::take(&mut self.buffers);
        let events = std::mem::replace(&mut self.pending, 0);

        let (batch, errors) = encoder::encode_batch(self.header(), events, buffers);
        for err in errors {
            metrics::incr(&METRICS.keys_dropped);
            log::error!("sender {} dropped key from batch: {}", self.sender_id, err);
        }

        Some(batch)
    }

    /// Closes the current run and switches to `new_run`.
    ///
    /// Yields the pending data of the old run (if any) followed by an
    /// end-of-run marker carrying the new run id.
    pub fn end_run(&mut self, new_run: i64) -> Vec<Batch> {
        let mut out: Vec<Batch> = self.flush().into_iter().collect();
        out.push(Batch::end_of_run(
            new_run,
            self.sender_id,
            self.events_seen,
            util::now_event_time(),
        ));

        self.run_id = new_run;
        self.events_seen = 0;
        out
    }

    /// Final flush when the source is exhausted.
    pub fn finish(&mut self) -> Vec<Batch> {
        let mut out: Vec<Batch> = self.flush().into_iter().collect();
        out.push(Batch::end_of_run(
            self.run_id,
            self.sender_id,
            self.events_seen,
            util::now_event_time(),
        ));
        out
    }

    fn header(&self) -> BatchHeader {
        BatchHeader {
            run_id: self.run_id,
            sender_id: self.sender_id,
            event_count_seen: self.events_seen,
            send_timestamp: util::now_event_time(),
        }
    }

    /// `Err(detector)` for the first rule the event fails.
    fn gate(&self, damage: &BTreeMap<String, f64>) -> Result<(), String> {
        for rule in &self.gating {
            match damage.get(&rule.detector) {
                Some(v) if *v < rule.min => return Err(rule.detector.clone()),
                None if rule.required => return Err(rule.detector.clone()),
                _ => {}
            }
        }
        Ok(())
    }

    fn forwards(&self, key: &str) -> bool {
        if util::contains_any(key, &self.forward.never) {
            return false;
        }
        if self.forward.keys.is_empty() {
            return true;
        }
        self.forward.keys.iter().any(|k| k == key) || util::contains_any(key, &self.forward.always)
    }
}

impl DerivedField {
    /// Sum of the scalar inputs; a NaN or infinite sum is an error.
    pub fn compute(&self, flat: &BTreeMap<String, Value>) -> Result<f64, SkipReason> {
        let sum = self.inputs.iter().try_fold(0.0, |acc, input| {
            let value = flat
                .get(input)
                .ok_or_else(|| SkipReason::MissingData(input.clone()))?;
            let v = value
                .as_f64()
                .ok_or_else(|| SkipReason::NotScalar(input.clone()))?;
            Ok(acc + v)
        })?;

        if sum.is_finite() {
            Ok(sum)
        } else {
            Err(SkipReason::NonFinite(self.name.clone()))
        }
    }
}

/// Flattens one level of nesting into `group__subkey` keys.
fn flatten(fields: BTreeMap<String, Field>) -> BTreeMap<String, Value> {
    let mut flat = BTreeMap::new();

    for (key, field) in fields {
        match field {
            Field::Value(v) => {
                flat.insert(key, v);
            }
            Field::Group(sub) => {
                for (subkey, inner) in sub {
                    match inner {
                        Field::Value(v) => {
                            flat.insert(util::flat_key(&key, &subkey), v);
                        }
                        Field::Group(_) => {
                            log::debug!("ignoring nested group {}/{}", key, subkey);
                        }
                    }
                }
            }
        }
    }

    flat
}
