//! Serialization and framing for control-plane messages.
//!
//! Messages are JSON-encoded and sent as a single length-prefixed frame:
//!
//! ```text
//! [u32 length (LE)][JSON payload bytes]
//! ```
//!
//! The prefix lets a server read exactly one request off a stream with
//! `read_exact`, leaving every byte that follows for the room relay.

use crate::control::{ControlRequest, ControlResponse};

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Frame is incomplete or has an invalid length prefix.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Encodes a [`ControlRequest`] as a JSON payload (no length prefix).
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the request cannot be serialized.
pub fn encode_request(request: &ControlRequest) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(request).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a [`ControlRequest`] from a JSON payload.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the payload is not valid JSON, has
/// an unknown `action`, or lacks a required field.
pub fn decode_request(payload: &[u8]) -> Result<ControlRequest, CodecError> {
    serde_json::from_slice(payload).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes a [`ControlResponse`] as a JSON payload (no length prefix).
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the response cannot be serialized.
pub fn encode_response(response: &ControlResponse) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(response).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a [`ControlResponse`] from a JSON payload.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the payload cannot be deserialized.
pub fn decode_response(payload: &[u8]) -> Result<ControlResponse, CodecError> {
    serde_json::from_slice(payload).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Prepends the 4-byte little-endian length prefix to `payload`.
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` if the payload exceeds `u32::MAX` bytes.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        CodecError::InvalidFrame(format!(
            "payload too large for framing: {} bytes",
            payload.len()
        ))
    })?;
    let mut framed = Vec::with_capacity(HEADER_LEN + payload.len());
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(payload);
    Ok(framed)
}

/// Reads the payload length out of a frame header.
#[must_use]
pub fn payload_len(header: [u8; HEADER_LEN]) -> usize {
    u32::from_le_bytes(header) as usize
}

/// Splits one length-prefixed frame off the front of `bytes`.
///
/// Returns the payload and the total number of bytes consumed (including
/// the prefix).
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` if the input is shorter than the
/// prefix or than the length the prefix announces.
pub fn decode_framed(bytes: &[u8]) -> Result<(&[u8], usize), CodecError> {
    let Some((header, rest)) = bytes.split_first_chunk::<HEADER_LEN>() else {
        return Err(CodecError::InvalidFrame(format!(
            "need at least {HEADER_LEN} bytes for length prefix, got {}",
            bytes.len()
        )));
    };
    let len = payload_len(*header);
    let Some(payload) = rest.get(..len) else {
        return Err(CodecError::InvalidFrame(format!(
            "frame indicates {len} bytes but only {} available",
            rest.len()
        )));
    };
    Ok((payload, HEADER_LEN + len))
}
