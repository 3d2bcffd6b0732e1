//! Binary record codec for the local message log.
//!
//! A log file is a plain concatenation of frames:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┐
//! │ len: u32 LE  │ postcard(LogRecord), len B   │ ...
//! └──────────────┴──────────────────────────────┘
//! ```
//!
//! Appending never rewrites earlier frames, and a reader can stop at the
//! first incomplete frame without losing the ones before it.

use serde::{Deserialize, Serialize};

use crate::message::{ConversationId, Message};

/// Size of the length prefix in bytes.
const PREFIX_LEN: usize = 4;

/// One persisted log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Conversation the message belongs to.
    pub conversation: ConversationId,
    /// The confirmed message.
    pub message: Message,
}

/// Errors from encoding or decoding log records.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// postcard rejected the record or the payload bytes.
    #[error("postcard: {0}")]
    Postcard(postcard::Error),
    /// Fewer bytes remain than the frame needs.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes the frame declares (prefix included).
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },
    /// The payload does not fit a `u32` length prefix.
    #[error("record of {0} bytes is too large to frame")]
    TooLarge(usize),
}

/// Serializes a record without framing.
///
/// # Errors
///
/// Returns [`CodecError::Postcard`] if serialization fails.
pub fn encode(record: &LogRecord) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(record).map_err(CodecError::Postcard)
}

/// Deserializes an unframed record.
///
/// # Errors
///
/// Returns [`CodecError::Postcard`] if `bytes` is not a valid record.
pub fn decode(bytes: &[u8]) -> Result<LogRecord, CodecError> {
    postcard::from_bytes(bytes).map_err(CodecError::Postcard)
}

/// Serializes a record behind its length prefix.
///
/// # Errors
///
/// Returns [`CodecError::Postcard`] if serialization fails or
/// [`CodecError::TooLarge`] if the payload exceeds `u32::MAX` bytes.
pub fn encode_framed(record: &LogRecord) -> Result<Vec<u8>, CodecError> {
    let payload = encode(record)?;
    let len = u32::try_from(payload.len()).map_err(|_| CodecError::TooLarge(payload.len()))?;
    let mut out = len.to_le_bytes().to_vec();
    out.extend(payload);
    Ok(out)
}

/// Reads the frame at the start of `bytes`.
///
/// Returns the record and the number of bytes the frame occupies.
///
/// # Errors
///
/// Returns [`CodecError::Truncated`] when the prefix or payload is
/// incomplete and [`CodecError::Postcard`] when the payload is corrupt.
pub fn decode_framed(bytes: &[u8]) -> Result<(LogRecord, usize), CodecError> {
    let Some((prefix, rest)) = bytes.split_first_chunk::<PREFIX_LEN>() else {
        return Err(CodecError::Truncated {
            needed: PREFIX_LEN,
            available: bytes.len(),
        });
    };
    let len = u32::from_le_bytes(*prefix) as usize;
    let Some(payload) = rest.get(..len) else {
        return Err(CodecError::Truncated {
            needed: PREFIX_LEN + len,
            available: bytes.len(),
        });
    };
    Ok((decode(payload)?, PREFIX_LEN + len))
}

/// Decodes every complete frame in `bytes`.
///
/// Stops at the first incomplete or corrupt frame and returns the records
/// decoded so far together with the number of bytes they occupy.
#[must_use]
pub fn decode_all(bytes: &[u8]) -> (Vec<LogRecord>, usize) {
    let mut records = Vec::new();
    let mut consumed = 0;
    while consumed < bytes.len() {
        let Ok((record, used)) = decode_framed(&bytes[consumed..]) else {
            break;
        };
        records.push(record);
        consumed += used;
    }
    (records, consumed)
}
