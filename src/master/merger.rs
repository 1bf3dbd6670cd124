use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::encoder;
use crate::metrics::{self, METRICS};
use crate::schema::{Batch, NO_RUN};

use super::oracle::RunOracle;
use super::table::SharedTable;

/// Tunables of the merge loop.
#[derive(Debug, Clone)]
pub struct MergerSettings {
    /// Column every other column is compared against after a merge
    pub reference_key: String,

    /// Metadata key substrings skipped by the alignment check
    pub alignment_exclude: Vec<String>,

    /// Ask the oracle every N received batches; 0 disables polling
    pub poll_every_batches: u64,
}

/// What handling one batch did to the table.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged {
        keys: usize,
        dropped: usize,
        misaligned: usize,
    },
    Reset {
        run_id: i64,
    },
}

/// Central state machine of the master.
///
/// Always `ACTIVE(run_id)`; three triggers:
/// - end-of-run batch   -> reset to the oracle's current run
/// - oracle poll change -> same reset
/// - normal batch       -> append per key
///
/// The merger is the only writer of the table. Each merge and each
/// reset runs under one write-lock acquisition, so a snapshot sees
/// either the state before or after, never a mix.
pub struct Merger {
    table: SharedTable,
    oracle: Option<Arc<dyn RunOracle>>,
    settings: MergerSettings,
    received: u64,
}

impl Merger {
    pub fn new(
        table: SharedTable,
        oracle: Option<Arc<dyn RunOracle>>,
        settings: MergerSettings,
    ) -> Self {
        Self {
            table,
            oracle,
            settings,
            received: 0,
        }
    }

    /// Drains the scatter queue until cancelled or every sender
    /// connection is gone.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Batch>, cancel: CancellationToken) {
        log::info!("merger started");

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = rx.recv() => batch,
            };

            let Some(batch) = batch else {
                log::info!("scatter queue closed");
                break;
            };

            self.handle(batch).await;
        }

        log::info!("merger stopped after {} batches", self.received);
    }

    /// Applies one batch to the table.
    pub async fn handle(&mut self, mut batch: Batch) -> MergeOutcome {
        self.received += 1;

        let poll_every = self.settings.poll_every_batches;
        if poll_every > 0 && (self.received - 1) % poll_every == 0 {
            self.poll_oracle().await;
        }

        if batch.end_of_run {
            log::info!(
                "end of run signalled by sender {} (run {})",
                batch.sender_id,
                batch.run_id
            );
            let run_id = self.fresh_run_id(batch.run_id).await;
            self.reset(run_id).await;
            return MergeOutcome::Reset { run_id };
        }

        let expected = batch.event_count_sent as usize;
        let fields = std::mem::take(&mut batch.fields);
        let (fields, errors) = encoder::check_alignment(fields, expected);

        for err in &errors {
            metrics::incr(&METRICS.keys_dropped);
            log::warn!("sender {}: dropping key: {}", batch.sender_id, err);
        }

        let keys: Vec<String> = fields.keys().cloned().collect();
        batch.fields = fields;

        let sender_id = batch.sender_id;
        let misaligned = {
            let mut table = self.table.write().await;
            if table.run_id() != NO_RUN && batch.run_id != table.run_id() {
                log::debug!(
                    "sender {} batch tagged run {} merged into run {}",
                    sender_id,
                    batch.run_id,
                    table.run_id()
                );
            }
            table.append(batch);
            table.misaligned(
                keys.iter().map(String::as_str),
                &self.settings.reference_key,
                &self.settings.alignment_exclude,
            )
        };

        for (key, len, ref_len) in &misaligned {
            metrics::incr(&METRICS.misaligned_columns);
            log::warn!(
                "out of alignment: {} has {} entries, {} has {}",
                key,
                len,
                self.settings.reference_key,
                ref_len
            );
        }

        metrics::incr(&METRICS.batches_merged);
        log::debug!("merged batch from sender {} ({} keys)", sender_id, keys.len());

        MergeOutcome::Merged {
            keys: keys.len(),
            dropped: errors.len(),
            misaligned: misaligned.len(),
        }
    }

    /// Resets the table when the oracle reports a different run.
    ///
    /// Returns the new run id when a reset happened.
    pub async fn poll_oracle(&mut self) -> Option<i64> {
        let oracle = self.oracle.as_ref()?;

        let run_id = match oracle.current_run_id().await {
            Ok(run_id) => run_id,
            Err(e) => {
                metrics::incr(&METRICS.oracle_errors);
                log::warn!("run oracle unavailable, keeping current run: {:#}", e);
                return None;
            }
        };

        if run_id == self.table.run_id().await {
            return None;
        }

        log::info!("run oracle reports new run {}", run_id);
        self.reset(run_id).await;
        Some(run_id)
    }

    /// Asks the oracle now; never reuses an earlier answer.
    ///
    /// Without an oracle, or when it fails, the run id the sender put
    /// on the end-of-run batch is used. A sender that knows no run
    /// leaves the current id in place.
    async fn fresh_run_id(&self, signalled: i64) -> i64 {
        if let Some(oracle) = &self.oracle {
            match oracle.current_run_id().await {
                Ok(run_id) => return run_id,
                Err(e) => {
                    metrics::incr(&METRICS.oracle_errors);
                    log::warn!("run oracle unavailable at end of run: {:#}", e);
                }
            }
        }

        if signalled != NO_RUN {
            signalled
        } else {
            self.table.run_id().await
        }
    }

    async fn reset(&self, run_id: i64) {
        self.table.write().await.reset(run_id);
        metrics::incr(&METRICS.resets);
        log::info!("master table reset, run {}", run_id);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::master::oracle::FixedOracle;
    use crate::schema::{EventTime, Value};

    struct FailingOracle;

    #[async_trait::async_trait]
    impl RunOracle for FailingOracle {
        async fn current_run_id(&self) -> anyhow::Result<i64> {
            anyhow::bail!("logbook down")
        }
    }

    fn settings(poll_every_batches: u64) -> MergerSettings {
        MergerSettings {
            reference_key: "event_time".to_string(),
            alignment_exclude: vec!["nEvts".to_string(), "send_timeStamp".to_string()],
            poll_every_batches,
        }
    }

    fn batch(sender: u32, run: i64, events: usize, keys: &[&str]) -> Batch {
        let mut fields = BTreeMap::new();
        for key in keys {
            fields.insert(key.to_string(), vec![Value::Float(sender as f64); events]);
        }
        Batch {
            run_id: run,
            sender_id: sender,
            event_count_seen: events as u64,
            event_count_sent: events as u64,
            send_timestamp: EventTime::new(0, 0),
            fields,
            end_of_run: false,
        }
    }

    fn eor(sender: u32, run: i64) -> Batch {
        Batch::end_of_run(run, sender, 0, EventTime::new(0, 0))
    }

    #[tokio::test]
    async fn merge_order_does_not_change_lengths() {
        let b1 = batch(1, 5, 10, &["event_time", "ipm2__sum"]);
        let b2 = batch(2, 5, 7, &["event_time", "ipm2__sum", "gas"]);

        let forward = SharedTable::new();
        let mut m = Merger::new(forward.clone(), None, settings(0));
        m.handle(b1.clone()).await;
        m.handle(b2.clone()).await;

        let backward = SharedTable::new();
        let mut m = Merger::new(backward.clone(), None, settings(0));
        m.handle(b2).await;
        m.handle(b1).await;

        let a = forward.snapshot().await;
        let b = backward.snapshot().await;
        for key in ["event_time", "ipm2__sum", "gas"] {
            assert_eq!(a.len_of(key), b.len_of(key), "length of {}", key);
        }
        assert_eq!(a.len_of("event_time"), 17);
        assert_ne!(a.columns["ipm2__sum"], b.columns["ipm2__sum"]);
    }

    #[tokio::test]
    async fn end_of_run_clears_and_takes_oracle_run() {
        let table = SharedTable::new();
        let oracle = Arc::new(FixedOracle::new(5));
        let mut m = Merger::new(table.clone(), Some(oracle.clone()), settings(0));

        m.handle(batch(1, 5, 10, &["event_time", "ipm2__sum"])).await;
        oracle.set(6);

        // the marker's own run id is ignored when the oracle answers
        let outcome = m.handle(eor(1, 99)).await;
        assert_eq!(outcome, MergeOutcome::Reset { run_id: 6 });

        let snap = table.snapshot().await;
        assert_eq!(snap.run_id, 6);
        assert!(snap.is_empty());
    }

    #[tokio::test]
    async fn end_of_run_without_oracle_uses_signalled_run() {
        let table = SharedTable::new();
        let mut m = Merger::new(table.clone(), None, settings(0));

        m.handle(batch(1, 3, 4, &["event_time"])).await;
        assert_eq!(table.run_id().await, 3);

        m.handle(eor(1, 4)).await;
        assert_eq!(table.run_id().await, 4);

        m.handle(eor(1, NO_RUN)).await;
        assert_eq!(table.run_id().await, 4);
    }

    #[tokio::test]
    async fn oracle_poll_detects_new_run() {
        let table = SharedTable::new();
        let oracle = Arc::new(FixedOracle::new(1));
        let mut m = Merger::new(table.clone(), Some(oracle.clone()), settings(2));

        // first batch polls: -1 -> 1, then merges
        m.handle(batch(1, 1, 3, &["event_time"])).await;
        assert_eq!(table.run_id().await, 1);
        assert_eq!(table.snapshot().await.len_of("event_time"), 3);

        oracle.set(2);
        // second batch is not a poll point
        m.handle(batch(2, 1, 3, &["event_time"])).await;
        assert_eq!(table.snapshot().await.len_of("event_time"), 6);

        // third batch polls, resets, then merges into the new run
        m.handle(batch(1, 2, 3, &["event_time"])).await;
        let snap = table.snapshot().await;
        assert_eq!(snap.run_id, 2);
        assert_eq!(snap.len_of("event_time"), 3);
    }

    #[tokio::test]
    async fn failing_oracle_keeps_state() {
        let table = SharedTable::new();
        let mut m = Merger::new(table.clone(), Some(Arc::new(FailingOracle)), settings(1));

        m.handle(batch(1, 8, 2, &["event_time"])).await;
        m.handle(batch(1, 8, 2, &["event_time"])).await;
        assert_eq!(table.run_id().await, 8);
        assert_eq!(table.snapshot().await.len_of("event_time"), 4);

        // end of run still resets, falling back to the signalled run
        m.handle(eor(1, 9)).await;
        assert_eq!(table.run_id().await, 9);
        assert!(table.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_key_is_dropped_rest_is_merged() {
        let table = SharedTable::new();
        let mut m = Merger::new(table.clone(), None, settings(0));

        let mut b = batch(1, 1, 5, &["event_time", "ipm2__sum"]);
        b.fields.insert("tt__ampl".to_string(), vec![Value::Float(0.0); 3]);

        let outcome = m.handle(b).await;
        assert_eq!(
            outcome,
            MergeOutcome::Merged {
                keys: 2,
                dropped: 1,
                misaligned: 0
            }
        );
        let snap = table.snapshot().await;
        assert_eq!(snap.len_of("tt__ampl"), 0);
        assert_eq!(snap.len_of("ipm2__sum"), 5);
    }

    #[tokio::test]
    async fn late_key_is_reported_misaligned() {
        let table = SharedTable::new();
        let mut m = Merger::new(table.clone(), None, settings(0));

        m.handle(batch(1, 1, 5, &["event_time"])).await;
        let outcome = m
            .handle(batch(1, 1, 5, &["event_time", "ipm2__sum", "nEvts_sent"]))
            .await;

        assert_eq!(
            outcome,
            MergeOutcome::Merged {
                keys: 3,
                dropped: 0,
                misaligned: 1
            }
        );
    }

    #[tokio::test]
    async fn snapshots_never_see_a_half_reset_table() {
        let table = SharedTable::new();
        let mut m = Merger::new(table.clone(), None, settings(0));
        let keys = ["event_time", "ipm2__sum", "gas", "tt__ampl"];

        let reader = {
            let table = table.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    let snap = table.snapshot().await;
                    let lens: Vec<usize> = keys.iter().map(|k| snap.len_of(k)).collect();
                    assert!(
                        lens.iter().all(|l| *l == lens[0]),
                        "mixed snapshot: {:?}",
                        lens
                    );
                    tokio::task::yield_now().await;
                }
            })
        };

        for round in 0..200 {
            m.handle(batch(1 + round % 3, 1, 10, &keys)).await;
            if round % 7 == 6 {
                m.handle(eor(1, 1 + round as i64)).await;
            }
            tokio::task::yield_now().await;
        }

        reader.await.unwrap();
    }
}
