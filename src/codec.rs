//! Wire format for incoming telemetry.
//!
//! Two levels of nesting:
//! ```text
//! Envelope { messages: repeated bytes }   <- one queue delivery
//!   └─ Batch { batch_id, sensor, readings: repeated Reading }
//!        └─ Reading { t: int64, v: double }
//! ```
//! Every element of `Envelope.messages` is an independently encoded `Batch`,
//! so a broken inner batch never prevents its siblings from decoding.

use std::fmt;

use prost::Message;
use thiserror::Error;

#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub messages: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Batch {
    /// opaque producer id, never used for dedup
    #[prost(int64, tag = "1")]
    pub batch_id: i64,
    #[prost(string, tag = "2")]
    pub sensor: String,
    #[prost(message, repeated, tag = "3")]
    pub readings: Vec<Reading>,
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct Reading {
    /// producer-defined unit
    #[prost(int64, tag = "1")]
    pub t: i64,
    #[prost(double, tag = "2")]
    pub v: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    Envelope,
    Batch,
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Envelope => write!(f, "envelope"),
            Self::Batch => write!(f, "batch"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed {kind}: {source}")]
    Malformed {
        kind: DecodeErrorKind,
        #[source]
        source: prost::DecodeError,
    },
    #[error("batch {batch_id} has an empty sensor name")]
    EmptySensor { batch_id: i64 },
}

impl DecodeError {
    pub fn kind(&self) -> DecodeErrorKind {
        match self {
            Self::Malformed { kind, .. } => *kind,
            Self::EmptySensor { .. } => DecodeErrorKind::Batch,
        }
    }
}

/// Splits a delivery into its still-encoded batches.
/// All or nothing: a malformed envelope yields no batches at all.
pub fn decode_envelope(bytes: &[u8]) -> Result<Vec<Vec<u8>>, DecodeError> {
    Envelope::decode(bytes)
        .map(|envelope| envelope.messages)
        .map_err(|source| DecodeError::Malformed {
            kind: DecodeErrorKind::Envelope,
            source,
        })
}

pub fn decode_batch(bytes: &[u8]) -> Result<Batch, DecodeError> {
    let batch = Batch::decode(bytes).map_err(|source| DecodeError::Malformed {
        kind: DecodeErrorKind::Batch,
        source,
    })?;

    if batch.sensor.is_empty() {
        return Err(DecodeError::EmptySensor {
            batch_id: batch.batch_id,
        });
    }

    Ok(batch)
}

pub fn encode_batch(batch: &Batch) -> Vec<u8> {
    batch.encode_to_vec()
}

pub fn encode_envelope(batches: &[Batch]) -> Vec<u8> {
    Envelope {
        messages: batches.iter().map(encode_batch).collect(),
    }
    .encode_to_vec()
}
