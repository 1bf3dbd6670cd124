use serde::Deserialize;

use crate::binning::ScanConfig;
use crate::schema::EVENT_TIME_KEY;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// This is the top-level configuration structure loaded from
// `config.json` (or the path given as first argument).
//
// It defines:
// - Which role this process plays
// - Master endpoints and merge settings
// - Worker batching, gating and source settings
// - Optional run oracle, probe and debug configuration
//
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Role of this process
    pub role: Role,

    /// Master endpoints; required for `master`
    pub master: Option<MasterConfig>,

    /// Run-boundary oracle used by the master
    pub oracle: Option<OracleConfig>,

    /// Worker settings; required for `worker`
    pub worker: Option<WorkerConfig>,

    /// Snapshot probe settings; required for `probe`
    pub probe: Option<ProbeConfig>,

    /// Optional debug configuration
    pub debug: Option<DebugConfig>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Worker,
    Probe,
}

impl Config {
    /// Checks the semantic constraints serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.role {
            Role::Master => {
                if self.master.is_none() {
                    anyhow::bail!("role 'master' requires a 'master' section");
                }
            }
            Role::Worker => {
                let Some(worker) = &self.worker else {
                    anyhow::bail!("role 'worker' requires a 'worker' section");
                };
                worker.validate()?;
            }
            Role::Probe => {
                if self.probe.is_none() {
                    anyhow::bail!("role 'probe' requires a 'probe' section");
                }
            }
        }
        Ok(())
    }

    pub fn debug_log(&self) -> bool {
        self.debug.as_ref().map_or(false, |d| d.log.unwrap_or(false))
    }
}

// ------------------------------------------------------------
// Master configuration
// ------------------------------------------------------------
//
// Notes:
// - `scatter_addr` is where workers connect and push batches.
// - `snapshot_addr` is where consumers request snapshots.
// - `queue_capacity` bounds the batches buffered between the
//   connection readers and the merger. When full, readers stop
//   reading their socket and TCP flow control blocks the worker.
//
#[derive(Debug, Deserialize, Clone)]
pub struct MasterConfig {
    pub scatter_addr: String,

    pub snapshot_addr: String,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Column the alignment check compares every other column against
    #[serde(default = "default_reference_key")]
    pub reference_key: String,

    /// Keys containing any of these substrings are metadata and are
    /// skipped by the alignment check
    #[serde(default = "default_alignment_exclude")]
    pub alignment_exclude: Vec<String>,

    /// Send snapshot replies as gzip-compressed binary frames
    #[serde(default)]
    pub compress_replies: bool,
}

// ------------------------------------------------------------
// Run oracle configuration
// ------------------------------------------------------------
//
// `fixed` always reports the same run (offline replay, tests).
// `logbook` asks the experiment logbook web service for the
// current run of the active experiment on an instrument.
//
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OracleConfig {
    Fixed {
        run_id: i64,

        #[serde(default)]
        poll_every_batches: u64,
    },
    Logbook {
        url: String,

        instrument: String,

        #[serde(default)]
        station: u32,

        #[serde(default)]
        poll_every_batches: u64,

        #[serde(default = "default_oracle_timeout_ms")]
        timeout_ms: u64,
    },
}

impl OracleConfig {
    pub fn poll_every_batches(&self) -> u64 {
        match self {
            OracleConfig::Fixed { poll_every_batches, .. } => *poll_every_batches,
            OracleConfig::Logbook { poll_every_batches, .. } => *poll_every_batches,
        }
    }
}

// ------------------------------------------------------------
// Worker configuration
// ------------------------------------------------------------
//
// Controls how one worker batches and forwards events.
//
// IMPORTANT:
// - `sender_id` must be unique per worker; it is only used
//   for diagnostics on the master.
// - `forward.keys` empty means "forward everything".
//
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    pub sender_id: u32,

    /// WebSocket URL of the master scatter endpoint
    pub master_url: String,

    /// Accepted events per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Cap on this sender's contribution rate (events/second)
    #[serde(default)]
    pub target_events_per_sec: Option<f64>,

    /// Send batches as gzip-compressed binary frames
    #[serde(default)]
    pub compress: bool,

    /// Demo mode flag (no connection, batches only logged)
    #[serde(default)]
    pub demo: bool,

    /// Stop after examining this many events
    #[serde(default)]
    pub max_events: Option<u64>,

    /// Only examine every `of`-th event, starting at `rank`
    #[serde(default)]
    pub stride: Option<StrideConfig>,

    #[serde(default)]
    pub forward: ForwardConfig,

    #[serde(default)]
    pub gating: Vec<GateRule>,

    #[serde(default)]
    pub derived: Vec<DerivedField>,

    pub source: SourceConfig,
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("worker.batch_size must be greater than zero");
        }
        if let Some(rate) = self.target_events_per_sec {
            if rate.is_nan() || rate <= 0.0 {
                anyhow::bail!("worker.target_events_per_sec must be positive");
            }
        }
        if let Some(stride) = &self.stride {
            if stride.of == 0 || stride.rank >= stride.of {
                anyhow::bail!(
                    "worker.stride needs rank < of, got rank={} of={}",
                    stride.rank,
                    stride.of
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct StrideConfig {
    pub rank: u64,
    pub of: u64,
}

// ------------------------------------------------------------
// Key forwarding
// ------------------------------------------------------------
//
// Decides which flattened keys leave the worker.
//
// Order of evaluation:
// 1. `never` substrings always win
// 2. empty `keys` forwards everything
// 3. listed keys and `always` substrings are forwarded
//
#[derive(Debug, Deserialize, Clone)]
pub struct ForwardConfig {
    #[serde(default)]
    pub keys: Vec<String>,

    #[serde(default = "default_always_forward")]
    pub always: Vec<String>,

    #[serde(default = "default_never_forward")]
    pub never: Vec<String>,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            always: default_always_forward(),
            never: default_never_forward(),
        }
    }
}

/// Drop the event when `damage[detector] < min`.
///
/// A detector absent from the damage map only drops the event
/// when `required` is set.
#[derive(Debug, Deserialize, Clone)]
pub struct GateRule {
    pub detector: String,

    #[serde(default = "default_gate_min")]
    pub min: f64,

    #[serde(default)]
    pub required: bool,
}

/// Sum of scalar inputs, or `default` when any input is missing.
#[derive(Debug, Deserialize, Clone)]
pub struct DerivedField {
    pub name: String,
    pub inputs: Vec<String>,

    #[serde(default)]
    pub default: f64,
}

// ------------------------------------------------------------
// Event source configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Random measurements for demos and load tests
    Synthetic {
        run_id: i64,

        /// Scalar keys to generate, nested as group__subkey when they
        /// contain the separator
        keys: Vec<String>,

        /// Detectors reported in the damage map
        #[serde(default)]
        detectors: Vec<String>,

        /// Probability that a detector reads as damaged
        #[serde(default)]
        damage_probability: f64,

        #[serde(default)]
        events: Option<u64>,

        #[serde(default)]
        seed: Option<u64>,
    },

    /// Newline-delimited JSON replay file, one event per line
    Jsonl { path: String },
}

// ------------------------------------------------------------
// Probe configuration
// ------------------------------------------------------------
//
// A consumer that polls the snapshot server; optionally runs a
// binned scan over each snapshot.
//
#[derive(Debug, Deserialize, Clone)]
pub struct ProbeConfig {
    pub snapshot_url: String,

    #[serde(default = "default_probe_target")]
    pub target: String,

    #[serde(default = "default_probe_repeat")]
    pub repeat: u64,

    #[serde(default = "default_probe_interval_ms")]
    pub interval_ms: u64,

    #[serde(default)]
    pub scan: Option<ScanConfig>,
}

// ------------------------------------------------------------
// Debug configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct DebugConfig {
    /// Enables debug-level logging (RUST_LOG still overrides)
    pub log: Option<bool>,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_reference_key() -> String {
    EVENT_TIME_KEY.to_string()
}

fn default_alignment_exclude() -> Vec<String> {
    vec!["nEvts".to_string(), "send_timeStamp".to_string()]
}

fn default_oracle_timeout_ms() -> u64 {
    2_000
}

fn default_batch_size() -> usize {
    50
}

fn default_always_forward() -> Vec<String> {
    vec!["scan".to_string()]
}

fn default_never_forward() -> Vec<String> {
    vec!["scan__varStep".to_string(), "damage__scan".to_string()]
}

fn default_gate_min() -> f64 {
    1.0
}

fn default_probe_target() -> String {
    "Request_probe".to_string()
}

fn default_probe_repeat() -> u64 {
    1
}

fn default_probe_interval_ms() -> u64 {
    1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_config_applies_defaults() {
        let json = r#"{
            "role": "worker",
            "worker": {
                "sender_id": 2,
                "master_url": "ws://127.0.0.1:5555",
                "gating": [{"detector": "evr0", "required": true}],
                "source": {"kind": "jsonl", "path": "events.jsonl"}
            }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        cfg.validate().unwrap();
        assert!(!cfg.debug_log());

        let worker = cfg.worker.unwrap();
        assert_eq!(worker.batch_size, 50);
        assert_eq!(worker.forward.always, vec!["scan".to_string()]);
        assert_eq!(worker.gating[0].min, 1.0);
    }

    #[test]
    fn role_without_section_is_rejected() {
        let cfg: Config = serde_json::from_str(r#"{"role": "master"}"#).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_stride_is_rejected() {
        let json = r#"{
            "role": "worker",
            "worker": {
                "sender_id": 1,
                "master_url": "ws://x",
                "stride": {"rank": 3, "of": 3},
                "source": {"kind": "jsonl", "path": "e"}
            }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn oracle_variants_parse() {
        let fixed: OracleConfig =
            serde_json::from_str(r#"{"kind": "fixed", "run_id": 7}"#).unwrap();
        assert_eq!(fixed.poll_every_batches(), 0);

        let logbook: OracleConfig = serde_json::from_str(
            r#"{"kind": "logbook", "url": "https://lb", "instrument": "XPP", "poll_every_batches": 4}"#,
        )
        .unwrap();
        assert_eq!(logbook.poll_every_batches(), 4);
    }
}
