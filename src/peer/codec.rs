//! Signaling bundle codec: JSON → gzip → base64, and back.

use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{de::DeserializeOwned, Serialize};
use std::io::{Read, Write};

use crate::error::SignalError;

/// Decompression cap, guards against zip bombs
pub const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024;

pub fn encode<T: Serialize>(value: &T) -> Result<String, SignalError> {
    let json = serde_json::to_vec(value)?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json)?;
    let compressed = gz.finish()?;

    Ok(general_purpose::STANDARD.encode(compressed))
}

pub fn decode<T: DeserializeOwned>(s: &str) -> Result<T, SignalError> {
    let compressed = general_purpose::STANDARD.decode(s.trim())?;

    let gz = GzDecoder::new(&compressed[..]);
    let mut json = Vec::new();
    // one byte over the cap tells an oversized bundle from one that fits exactly
    gz.take(MAX_DECOMPRESSED_SIZE + 1).read_to_end(&mut json)?;
    if json.len() as u64 > MAX_DECOMPRESSED_SIZE {
        return Err(SignalError::TooLarge(MAX_DECOMPRESSED_SIZE));
    }

    Ok(serde_json::from_slice(&json)?)
}
