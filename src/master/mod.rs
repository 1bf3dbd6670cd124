//! Master runtime
//!
//! The master process runs three concurrent units, all owned here:
//! - scatter listener: accepts worker connections, queues batches
//! - merger: sole writer of the master table
//! - snapshot server: answers consumer requests with table copies
//!
//! They share one cancellation token. Binding either endpoint is the
//! only fatal failure; everything after startup is contained inside
//! the unit that hits it.

pub mod merger;
pub mod oracle;
pub mod table;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{MasterConfig, OracleConfig};
use crate::snapshot::SnapshotServer;
use crate::transport;

use merger::{Merger, MergerSettings};
use oracle::RunOracle;
use table::SharedTable;

/// A started master: bound endpoints plus its running tasks.
pub struct MasterRuntime {
    pub scatter_addr: SocketAddr,
    pub snapshot_addr: SocketAddr,
    pub table: SharedTable,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl MasterRuntime {
    /// Binds both endpoints and spawns the three units.
    pub async fn start(
        cfg: &MasterConfig,
        oracle: Option<Arc<dyn RunOracle>>,
        poll_every_batches: u64,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let table = SharedTable::new();

        let scatter = transport::bind(&cfg.scatter_addr).await?;
        let scatter_addr = scatter.local_addr()?;

        let snapshots =
            SnapshotServer::bind(&cfg.snapshot_addr, table.clone(), cfg.compress_replies).await?;
        let snapshot_addr = snapshots.local_addr()?;

        log::info!(
            "master listening: scatter on {}, snapshots on {}",
            scatter_addr,
            snapshot_addr
        );

        let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));

        let merger = Merger::new(
            table.clone(),
            oracle,
            MergerSettings {
                reference_key: cfg.reference_key.clone(),
                alignment_exclude: cfg.alignment_exclude.clone(),
                poll_every_batches,
            },
        );

        let tasks = vec![
            (
                "scatter",
                tokio::spawn(transport::serve_scatter(scatter, tx, cancel.clone())),
            ),
            ("merger", tokio::spawn(merger.run(rx, cancel.clone()))),
            ("snapshot", tokio::spawn(snapshots.serve(cancel))),
        ];

        Ok(Self {
            scatter_addr,
            snapshot_addr,
            table,
            tasks,
        })
    }

    /// Waits for every unit to finish (after cancellation).
    pub async fn join(self) {
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                log::error!("{} task ended abnormally: {}", name, e);
            }
        }
    }
}

/// Runs the master until the token is cancelled.
pub async fn run_master(
    cfg: &MasterConfig,
    oracle_cfg: Option<&OracleConfig>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let oracle = oracle_cfg.map(oracle::build_oracle).transpose()?;
    let poll_every = oracle_cfg.map_or(0, |o| o.poll_every_batches());

    if oracle.is_none() {
        log::warn!("no run oracle configured; runs reset only on end-of-run markers");
    }

    let runtime = MasterRuntime::start(cfg, oracle, poll_every, cancel).await?;
    runtime.join().await;

    log::info!("master stopped");
    Ok(())
}
