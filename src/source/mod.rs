//! Event source registry and factory
//!
//! This module provides:
//! - The `EventSource` trait every extraction adapter implements
//! - A factory function resolving the configured source
//!
//! Detector-specific extraction must live in dedicated adapters.
//! The worker interacts exclusively through the trait.

pub mod adapter;
pub mod jsonl;
pub mod synthetic;

use adapter::EventSource;

use crate::config::SourceConfig;

/// Opens the event source described by the configuration.
///
/// ERRORS:
/// - A replay file that cannot be opened is a startup failure
pub async fn open_source(cfg: &SourceConfig) -> anyhow::Result<Box<dyn EventSource>> {
    match cfg {
        SourceConfig::Synthetic {
            run_id,
            keys,
            detectors,
            damage_probability,
            events,
            seed,
        } => Ok(Box::new(synthetic::SyntheticSource::new(
            *run_id,
            keys.clone(),
            detectors.clone(),
            *damage_probability,
            *events,
            *seed,
        ))),
        SourceConfig::Jsonl { path } => Ok(Box::new(jsonl::JsonlSource::open(path).await?)),
    }
}
