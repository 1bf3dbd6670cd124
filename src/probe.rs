use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::binning;
use crate::config::ProbeConfig;
use crate::schema::Snapshot;
use crate::snapshot::SnapshotClient;

/// Polls the snapshot server `repeat` times and reports what it sees.
///
/// A failed scan only affects that report; a failed request ends
/// the probe with an error.
pub async fn run_probe(cfg: &ProbeConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let mut client = SnapshotClient::connect(&cfg.snapshot_url).await?;

    for round in 0..cfg.repeat {
        if round > 0 {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(Duration::from_millis(cfg.interval_ms)) => {}
            }
        }

        let snapshot = tokio::select! {
            _ = cancel.cancelled() => break,
            snapshot = client.request(&cfg.target) => snapshot?,
        };

        report(&snapshot);

        if let Some(scan) = &cfg.scan {
            match binning::binned_scan(&snapshot, scan) {
                Ok(result) => {
                    log::info!("scan edges {:?}", result.edges);
                    log::info!("ratio_on  {:?}", result.ratio_on);
                    log::info!("ratio_off {:?}", result.ratio_off);
                }
                Err(e) => log::warn!("scan over run {} failed: {}", snapshot.run_id, e),
            }
        }
    }

    client.close().await;
    Ok(())
}

fn report(snapshot: &Snapshot) {
    log::info!(
        "run {}: {} batches, {} events, {} keys",
        snapshot.run_id,
        snapshot.batches_merged,
        snapshot.events_merged,
        snapshot.columns.len()
    );

    for (key, column) in &snapshot.columns {
        log::debug!("  {} len={}", key, column.len());
    }
}
