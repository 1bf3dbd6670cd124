use crate::error::SkipReason;
use crate::schema::ExtractedEvent;

/// EventSource is the abstraction layer between:
/// - The worker runtime (gating, batching, sending)
/// - Whatever produces structured measurements per event
///
/// Detector readout and feature computation happen behind this
/// trait; the worker only sees the resulting key/value mapping
/// and the damage indicators.
///
/// CONTRACT:
/// - `None` means the source is exhausted (end of run / file)
/// - `Some(Err(_))` skips one event; the worker keeps pulling
/// - Must never panic on bad input
///
#[async_trait::async_trait]
pub trait EventSource: Send {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Blocks until the next event is available.
    async fn next_event(&mut self) -> Option<Result<ExtractedEvent, SkipReason>>;
}
