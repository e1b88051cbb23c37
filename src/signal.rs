//! Session description codec for signaling over a single HTTP form field
//!
//! This module contains:
//! - Textual encoding of offer/answer payloads (JSON → gzip → base64)
//! - The inverse decoding with typed validation errors
//!
//! The codec knows nothing about SDP semantics; it is a pure byte transform
//! and is the first thing applied to untrusted form input, so decoding must
//! fail cleanly on arbitrary garbage.

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use thiserror::Error;

/// Failure to produce the textual form of a payload.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to compress payload: {0}")]
    Compress(#[from] std::io::Error),
}

/// Failure to recover a payload from its textual form.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64 text: {0}")]
    Alphabet(#[from] base64::DecodeError),

    #[error("truncated or corrupt compressed payload: {0}")]
    Compression(#[from] std::io::Error),

    #[error("payload is not a valid session description: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode a payload as base64-wrapped gzipped JSON.
///
/// The output contains no whitespace or control characters, so it survives a
/// URL-encoded form field unmodified.
pub fn encode<T: Serialize>(payload: &T) -> Result<String, EncodeError> {
    let json = serde_json::to_vec(payload)?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&json)?;
    let compressed = gz.finish()?;

    Ok(STANDARD.encode(compressed))
}

/// Decode a payload previously produced by [`encode`].
///
/// Returns a [`DecodeError`] naming the layer that rejected the input; never
/// panics, whatever the input.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, DecodeError> {
    let compressed = STANDARD.decode(text.trim())?;

    let mut json = Vec::new();
    GzDecoder::new(compressed.as_slice()).read_to_end(&mut json)?;

    Ok(serde_json::from_slice(&json)?)
}
