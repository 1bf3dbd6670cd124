//! Worker runtime
//!
//! A worker pulls events from its source, aggregates them into
//! batches and scatters the batches to the master over one
//! persistent connection.

pub mod aggregator;
pub mod runner;

use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::source;
use crate::transport::{BatchSink, ScatterSender};

/// Opens the source and the master connection, then runs to completion.
///
/// ERRORS:
/// - Unreadable source or unreachable master at startup are fatal
pub async fn run(cfg: &WorkerConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let source = source::open_source(&cfg.source).await?;

    let sink = if cfg.demo {
        log::warn!("worker {} in demo mode: nothing is sent", cfg.sender_id);
        BatchSink::Demo
    } else {
        BatchSink::Remote(ScatterSender::connect(&cfg.master_url, cfg.compress).await?)
    };

    let summary = runner::run_worker(cfg, source, sink, cancel).await?;
    log::debug!("worker summary: {:?}", summary);
    Ok(())
}
