// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - config:    Configuration structs loaded from JSON
// - schema:    Event, batch and snapshot definitions
// - error:     Typed per-event, per-batch and codec errors
// - util:      Shared helpers (wall clock, key flattening)
// - metrics:   Global runtime counters
// - encoder:   Batch building and WebSocket frame codec
// - transport: Scatter connections between workers and master
// - source:    Event source adapters and factory
// - worker:    Aggregation runtime of a worker process
// - master:    Merge table, merger, run oracle, master runtime
// - snapshot:  Snapshot server and client
// - binning:   Binned laser on/off scans over a snapshot
// - probe:     Snapshot consumer role
//
mod binning;
mod config;
mod encoder;
mod error;
mod master;
mod metrics;
mod probe;
mod schema;
mod snapshot;
mod source;
mod transport;
mod util;
mod worker;


// ------------------------------------------------------------
// External dependencies
// ------------------------------------------------------------

use rustls::crypto::{CryptoProvider, ring};
use tokio_util::sync::CancellationToken;

use config::{Config, Role};
use metrics::METRICS;

use std::fs;
use std::time::Duration;
use tokio::time::sleep;

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// One binary, three roles selected by configuration:
// - master: merge batches from all workers, serve snapshots
// - worker: aggregate events and scatter batches to the master
// - probe:  request snapshots and report on them
//
// Responsibilities:
// - Initialize cryptography backend (rustls)
// - Load and validate configuration
// - Initialize logging
// - Own the shutdown token (Ctrl-C)
// - Run the selected role to completion
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --------------------------------------------------------
    // IMPORTANT:
    // rustls >= 0.23 requires an explicit CryptoProvider
    // installation before any wss:// or https:// connection.
    // Must run exactly once, as early as possible.
    // --------------------------------------------------------
    CryptoProvider::install_default(ring::default_provider())
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    let path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let config = load_config(&path)?;

    let default_level = if config.debug_log() { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .target(env_logger::Target::Stderr)
        .init();

    log::info!("starting as {:?} with {}", config.role, path);
    if config.debug_log() {
        log::debug!("{:#?}", config);
    }

    // --------------------------------------------------------
    // Shutdown
    //
    // Ctrl-C cancels the shared token; every task selects on it
    // at its suspension points and winds down.
    // --------------------------------------------------------
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("interrupt received, shutting down");
            }
            cancel.cancel();
        }
    });

    // --------------------------------------------------------
    // Start metrics reporter (periodic, low-noise)
    // --------------------------------------------------------
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(Duration::from_secs(10)) => {}
                }
                log::info!("[METRICS] {}", METRICS.summary());
            }
        }
    });

    let result = match config.role {
        Role::Master => {
            let Some(master_cfg) = &config.master else {
                anyhow::bail!("missing master section");
            };
            master::run_master(master_cfg, config.oracle.as_ref(), cancel.clone()).await
        }
        Role::Worker => {
            let Some(worker_cfg) = &config.worker else {
                anyhow::bail!("missing worker section");
            };
            worker::run(worker_cfg, cancel.clone()).await
        }
        Role::Probe => {
            let Some(probe_cfg) = &config.probe else {
                anyhow::bail!("missing probe section");
            };
            probe::run_probe(probe_cfg, cancel.clone()).await
        }
    };

    cancel.cancel();
    log::info!("[METRICS] final {}", METRICS.summary());
    result
}

// ------------------------------------------------------------
// Configuration loader
// ------------------------------------------------------------
//
// Reads a JSON configuration file from disk, deserializes it
// into the strongly typed `Config` structure and checks the
// constraints serde cannot express.
//
fn load_config(path: &str) -> anyhow::Result<Config> {
    use anyhow::Context;

    let data = fs::read_to_string(path).with_context(|| format!("reading config {}", path))?;
    let cfg: Config =
        serde_json::from_str(&data).with_context(|| format!("parsing config {}", path))?;
    cfg.validate()?;
    Ok(cfg)
}
