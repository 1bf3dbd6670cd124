//! Batch encoder and frame codec.
//!
//! Two jobs live here:
//! - turning a worker's per-key buffers into a `Batch` that satisfies
//!   the alignment invariant
//! - turning batches and snapshots into WebSocket frames and back
//!
//! Frames are JSON text, or gzip-compressed JSON in a binary frame.
//! Decoders accept both, so the two ends may be configured
//! independently.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Serialize, de::DeserializeOwned};
use tokio_tungstenite::tungstenite::Message;

use crate::error::{BatchError, CodecError};
use crate::schema::{Batch, EventTime, Value};

/// Header fields of a batch, everything but the arrays.
#[derive(Debug, Clone, Copy)]
pub struct BatchHeader {
    pub run_id: i64,
    pub sender_id: u32,
    pub event_count_seen: u64,
    pub send_timestamp: EventTime,
}

/// Splits `fields` into keys that satisfy the alignment invariant and
/// the errors for those that do not.
///
/// A key is kept when it holds exactly `expected` values, all of them
/// share one shape, every tensor fills its shape and no number is NaN
/// or infinite. Offending keys are removed whole: nothing is truncated
/// or padded.
pub fn check_alignment(
    fields: BTreeMap<String, Vec<Value>>,
    expected: usize,
) -> (BTreeMap<String, Vec<Value>>, Vec<BatchError>) {
    let mut kept = BTreeMap::new();
    let mut errors = Vec::new();

    for (key, values) in fields {
        if values.len() != expected {
            errors.push(BatchError::LengthMismatch {
                key,
                expected,
                found: values.len(),
            });
            continue;
        }

        let consistent = values
            .first()
            .map(|first| {
                let shape = first.shape();
                values.iter().all(|v| v.shape() == shape)
            })
            .unwrap_or(true);

        if !consistent {
            errors.push(BatchError::ShapeMismatch { key });
            continue;
        }

        if !values.iter().all(Value::is_well_formed) {
            errors.push(BatchError::MalformedTensor { key });
            continue;
        }

        // serde_json writes these as null, which no longer parses
        if !values.iter().all(Value::is_finite) {
            errors.push(BatchError::NonFinite { key });
            continue;
        }

        kept.insert(key, values);
    }

    (kept, errors)
}

/// Packages buffered arrays into one batch.
///
/// `events` is the number of accepted events the buffers represent;
/// every kept key has exactly that many values. Keys that do not are
/// reported back to the caller, which logs them.
pub fn encode_batch(
    header: BatchHeader,
    events: usize,
    buffers: BTreeMap<String, Vec<Value>>,
) -> (Batch, Vec<BatchError>) {
    let (fields, errors) = check_alignment(buffers, events);

    let batch = Batch {
        run_id: header.run_id,
        sender_id: header.sender_id,
        event_count_seen: header.event_count_seen,
        event_count_sent: events as u64,
        send_timestamp: header.send_timestamp,
        fields,
        end_of_run: false,
    };

    (batch, errors)
}

/// Serializes a message into a WebSocket frame.
pub fn encode_frame<T: Serialize>(msg: &T, compress: bool) -> Result<Message, CodecError> {
    if !compress {
        let text = serde_json::to_string(msg)?;
        return Ok(Message::Text(text.into()));
    }

    let json = serde_json::to_vec(msg)?;
    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::fast());
    encoder.write_all(&json)?;
    let bytes = encoder.finish()?;

    Ok(Message::Binary(bytes.into()))
}

/// Parses a text or binary frame into a message.
///
/// Control frames (ping/pong/close) are not messages and return
/// `CodecError::UnsupportedFrame`; callers filter them out first.
pub fn decode_frame<T: DeserializeOwned>(msg: &Message) -> Result<T, CodecError> {
    match msg {
        Message::Text(text) => Ok(serde_json::from_str(text.as_str())?),
        Message::Binary(bytes) => {
            let mut json = Vec::with_capacity(bytes.len() * 4);
            GzDecoder::new(&bytes[..]).read_to_end(&mut json)?;
            Ok(serde_json::from_slice(&json)?)
        }
        _ => Err(CodecError::UnsupportedFrame),
    }
}

/// True for frames that carry a payload.
pub fn is_data_frame(msg: &Message) -> bool {
    matches!(msg, Message::Text(_) | Message::Binary(_))
}
