//! Run-boundary oracle adapters.
//!
//! The merger asks an oracle for the current run id on end-of-run
//! markers and on a periodic cadence. A failing oracle never stops
//! the merger: the caller treats errors as "no change".

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::config::OracleConfig;

#[async_trait::async_trait]
pub trait RunOracle: Send + Sync {
    /// Current run id as known by the external service.
    async fn current_run_id(&self) -> anyhow::Result<i64>;
}

/// Reports a run id set locally.
///
/// Used for offline replays where no run service exists, and by
/// tests that need to simulate a run transition.
pub struct FixedOracle {
    run_id: AtomicI64,
}

impl FixedOracle {
    pub fn new(run_id: i64) -> Self {
        Self {
            run_id: AtomicI64::new(run_id),
        }
    }

    pub fn set(&self, run_id: i64) {
        self.run_id.store(run_id, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl RunOracle for FixedOracle {
    async fn current_run_id(&self) -> anyhow::Result<i64> {
        Ok(self.run_id.load(Ordering::SeqCst))
    }
}

/// Asks the experiment logbook web service.
///
/// Two lookups per poll:
/// 1. active experiment for (instrument, station)
/// 2. current run of that experiment
pub struct LogbookOracle {
    client: reqwest::Client,
    base_url: String,
    instrument: String,
    station: u32,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    value: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Experiment {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RunDoc {
    num: i64,
}

impl LogbookOracle {
    pub fn new(
        base_url: &str,
        instrument: &str,
        station: u32,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building logbook http client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            instrument: instrument.to_uppercase(),
            station,
        })
    }

    async fn get_value<T: serde::de::DeserializeOwned>(&self, url: &str) -> anyhow::Result<T> {
        let envelope: Envelope<T> = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        envelope
            .value
            .ok_or_else(|| anyhow::anyhow!("empty logbook response from {}", url))
    }
}

#[async_trait::async_trait]
impl RunOracle for LogbookOracle {
    async fn current_run_id(&self) -> anyhow::Result<i64> {
        let url = format!(
            "{}/lgbk/ws/activeexperiment_for_instrument_station?instrument_name={}&station={}",
            self.base_url, self.instrument, self.station
        );
        let experiment: Experiment = self
            .get_value(&url)
            .await
            .with_context(|| format!("active experiment for {}", self.instrument))?;

        let url = format!("{}/lgbk/{}/ws/current_run", self.base_url, experiment.name);
        let run: RunDoc = self
            .get_value(&url)
            .await
            .with_context(|| format!("current run of {}", experiment.name))?;

        Ok(run.num)
    }
}

/// Builds the oracle described by the configuration.
pub fn build_oracle(cfg: &OracleConfig) -> anyhow::Result<Arc<dyn RunOracle>> {
    match cfg {
        OracleConfig::Fixed { run_id, .. } => Ok(Arc::new(FixedOracle::new(*run_id))),
        OracleConfig::Logbook {
            url,
            instrument,
            station,
            timeout_ms,
            ..
        } => Ok(Arc::new(LogbookOracle::new(
            url,
            instrument,
            *station,
            Duration::from_millis(*timeout_ms),
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_oracle_reports_latest_value() {
        let oracle = FixedOracle::new(10);
        assert_eq!(oracle.current_run_id().await.unwrap(), 10);
        oracle.set(11);
        assert_eq!(oracle.current_run_id().await.unwrap(), 11);
    }

    #[test]
    fn logbook_payloads_parse() {
        let exp: Envelope<Experiment> =
            serde_json::from_str(r#"{"success": true, "value": {"name": "xpplv1234"}}"#).unwrap();
        assert_eq!(exp.value.unwrap().name, "xpplv1234");

        let run: Envelope<RunDoc> =
            serde_json::from_str(r#"{"value": {"num": 87, "begin_time": "x"}}"#).unwrap();
        assert_eq!(run.value.unwrap().num, 87);

        let empty: Envelope<RunDoc> = serde_json::from_str(r#"{"value": null}"#).unwrap();
        assert!(empty.value.is_none());
    }

    #[tokio::test]
    async fn unreachable_logbook_is_an_error_not_a_panic() {
        let _ = rustls::crypto::CryptoProvider::install_default(
            rustls::crypto::ring::default_provider(),
        );

        let oracle =
            LogbookOracle::new("http://127.0.0.1:9", "xpp", 0, Duration::from_millis(200)).unwrap();
        assert!(oracle.current_run_id().await.is_err());
    }
}
