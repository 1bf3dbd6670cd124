use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockWriteGuard};

use crate::schema::{Batch, EventTime, NO_RUN, Snapshot, Value};
use crate::util;

/// Per-sender bookkeeping, diagnostics only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SenderStats {
    pub batches: u64,
    pub last_event_count_seen: u64,
    pub last_send_timestamp: Option<EventTime>,
}

/// Run-scoped accumulation of every merged batch.
///
/// Columns are append-only between resets and grow in batch arrival
/// order. Nothing here enforces equal column lengths; the merger
/// checks and logs.
#[derive(Debug)]
pub struct MasterTable {
    run_id: i64,
    columns: BTreeMap<String, Vec<Value>>,
    batches_merged: u64,
    events_merged: u64,
    resets: u64,
    senders: BTreeMap<u32, SenderStats>,
}

impl Default for MasterTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterTable {
    pub fn new() -> Self {
        Self {
            run_id: NO_RUN,
            columns: BTreeMap::new(),
            batches_merged: 0,
            events_merged: 0,
            resets: 0,
            senders: BTreeMap::new(),
        }
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }

    pub fn batches_merged(&self) -> u64 {
        self.batches_merged
    }

    pub fn len_of(&self, key: &str) -> usize {
        self.columns.get(key).map_or(0, |c| c.len())
    }

    pub fn sender(&self, sender_id: u32) -> Option<&SenderStats> {
        self.senders.get(&sender_id)
    }

    /// Clears all columns and counters and starts `run_id`.
    pub fn reset(&mut self, run_id: i64) {
        self.columns.clear();
        self.senders.clear();
        self.batches_merged = 0;
        self.events_merged = 0;
        self.resets += 1;
        self.run_id = run_id;
    }

    /// Appends every field of an already validated batch.
    ///
    /// The first batch carrying a real run id names the run when
    /// nothing else has.
    pub fn append(&mut self, batch: Batch) {
        if self.run_id == NO_RUN && batch.run_id != NO_RUN {
            self.run_id = batch.run_id;
        }

        for (key, values) in batch.fields {
            self.columns.entry(key).or_default().extend(values);
        }

        self.batches_merged += 1;
        self.events_merged += batch.event_count_sent;

        let stats = self.senders.entry(batch.sender_id).or_default();
        stats.batches += 1;
        stats.last_event_count_seen = batch.event_count_seen;
        stats.last_send_timestamp = Some(batch.send_timestamp);
    }

    /// Columns among `keys` whose length differs from `reference`.
    ///
    /// Keys matching an `exclude` substring and the reference itself
    /// are skipped. Returns `(key, length, reference length)`.
    pub fn misaligned<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a str>,
        reference: &str,
        exclude: &[String],
    ) -> Vec<(String, usize, usize)> {
        let ref_len = self.len_of(reference);

        keys.into_iter()
            .filter(|k| *k != reference && !util::contains_any(k, exclude))
            .filter_map(|k| {
                let len = self.len_of(k);
                (len != ref_len).then(|| (k.to_string(), len, ref_len))
            })
            .collect()
    }

    /// Copies the current state into a snapshot.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            run_id: self.run_id,
            columns: self.columns.clone(),
            batches_merged: self.batches_merged,
            events_merged: self.events_merged,
            taken_at: util::now_event_time(),
        }
    }
}

/// The master table behind its single exclusion mechanism.
///
/// The merger is the only writer. Readers copy under the read lock
/// and release it before doing any I/O with the copy.
#[derive(Clone, Default)]
pub struct SharedTable {
    inner: Arc<RwLock<MasterTable>>,
}

impl SharedTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consistent copy of the whole table.
    pub async fn snapshot(&self) -> Snapshot {
        self.inner.read().await.snapshot()
    }

    pub async fn run_id(&self) -> i64 {
        self.inner.read().await.run_id()
    }

    /// Exclusive access for the merger.
    pub async fn write(&self) -> RwLockWriteGuard<'_, MasterTable> {
        self.inner.write().await
    }
}
