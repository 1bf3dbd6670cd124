use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::config::{StrideConfig, WorkerConfig};
use crate::metrics::{self, METRICS};
use crate::schema::Batch;
use crate::source::adapter::EventSource;
use crate::transport::BatchSink;

use super::aggregator::{IngestOutcome, WorkerAggregator};

/// Paces flushes so a sender stays under a target event rate.
///
/// The budget is cumulative since start: a burst after an idle
/// stretch is allowed until the average catches up.
pub struct RateLimiter {
    events_per_sec: f64,
    started: Instant,
    released: u64,
}

impl RateLimiter {
    pub fn new(events_per_sec: f64) -> Self {
        Self {
            events_per_sec,
            started: Instant::now(),
            released: 0,
        }
    }

    /// How long to wait before `events` more may go out.
    pub fn delay_for(&self, events: u64) -> Duration {
        let due = (self.released + events) as f64 / self.events_per_sec;
        let elapsed = self.started.elapsed().as_secs_f64();
        Duration::try_from_secs_f64((due - elapsed).max(0.0)).unwrap_or(Duration::MAX)
    }

    pub fn mark(&mut self, events: u64) {
        self.released += events;
    }
}

/// What a worker did before stopping.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WorkerSummary {
    pub examined: u64,
    pub accepted: u64,
    pub gated: u64,
    pub skipped: u64,
    pub batches_sent: u64,
    pub cancelled: bool,
}

fn in_stride(index: u64, stride: Option<StrideConfig>) -> bool {
    stride.is_none_or(|s| index % s.of == s.rank)
}

/// Drives one worker: source -> aggregator -> sink.
///
/// Stops when the source is exhausted, `max_events` is reached or
/// the token is cancelled. In every case the pending buffers are
/// flushed and a closing end-of-run marker is sent.
///
/// ERRORS:
/// - A failed send ends the worker; the master keeps what it merged
pub async fn run_worker(
    cfg: &WorkerConfig,
    mut source: Box<dyn EventSource>,
    mut sink: BatchSink,
    cancel: CancellationToken,
) -> anyhow::Result<WorkerSummary> {
    let mut agg = WorkerAggregator::from_config(cfg);
    let mut limiter = cfg.target_events_per_sec.map(RateLimiter::new);
    let mut summary = WorkerSummary::default();
    let mut index: u64 = 0;

    log::info!(
        "worker {} reading from {} source",
        cfg.sender_id,
        source.name()
    );

    let result = async {
        loop {
            if cfg.max_events.is_some_and(|max| summary.examined >= max) {
                log::info!("worker {} reached max_events", cfg.sender_id);
                break;
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                next = source.next_event() => next,
            };

            let Some(next) = next else {
                log::info!("worker {} source exhausted", cfg.sender_id);
                break;
            };

            let current = index;
            index += 1;
            if !in_stride(current, cfg.stride) {
                continue;
            }
            summary.examined += 1;
            metrics::incr(&METRICS.events_seen);

            let event = match next {
                Ok(event) => event,
                Err(reason) => {
                    summary.skipped += 1;
                    metrics::incr(&METRICS.events_skipped);
                    agg.skip(&reason);
                    continue;
                }
            };

            if let Some(new_run) = agg.observe_run(event.run_id) {
                log::info!(
                    "worker {} run {} -> {}",
                    cfg.sender_id,
                    agg.run_id(),
                    new_run
                );
                for batch in agg.end_run(new_run) {
                    send(&mut sink, &batch, &mut summary).await?;
                }
            }

            match agg.ingest(event) {
                IngestOutcome::Accepted => {
                    summary.accepted += 1;
                    metrics::incr(&METRICS.events_accepted);
                }
                IngestOutcome::Gated { .. } => {
                    summary.gated += 1;
                    metrics::incr(&METRICS.events_gated);
                }
            }

            if let Some(batch) = agg.flush_if_due() {
                if let Some(limiter) = limiter.as_mut() {
                    let wait = limiter.delay_for(batch.event_count_sent);
                    if !wait.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                summary.cancelled = true;
                                send(&mut sink, &batch, &mut summary).await?;
                                break;
                            }
                            _ = sleep(wait) => {}
                        }
                    }
                    limiter.mark(batch.event_count_sent);
                }
                send(&mut sink, &batch, &mut summary).await?;
            }
        }

        for batch in agg.finish() {
            send(&mut sink, &batch, &mut summary).await?;
        }

        anyhow::Ok(())
    }
    .await;

    sink.close().await;

    log::info!(
        "worker {} done: examined={} accepted={} gated={} skipped={} batches={}",
        cfg.sender_id,
        summary.examined,
        summary.accepted,
        summary.gated,
        summary.skipped,
        summary.batches_sent
    );

    result.map(|_| summary)
}

async fn send(
    sink: &mut BatchSink,
    batch: &Batch,
    summary: &mut WorkerSummary,
) -> anyhow::Result<()> {
    sink.send(batch).await?;
    summary.batches_sent += 1;
    Ok(())
}
