//! Raw deflate compression for frame payloads.
//!
//! Frames carry a bare deflate stream: no zlib or gzip header, no checksum
//! trailer. Inflation is bounded so a small frame cannot expand without limit.

use crate::config::{DEFAULT_COMPRESSION_LEVEL, MAX_COMPRESSION_LEVEL, MAX_PAYLOAD_SIZE};
use crate::error::{constants, ProtocolError, Result};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Compression parameters for one pipeline direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateOptions {
    /// zlib-style level, 0 (store) to 9 (best)
    pub level: u32,
    /// Largest inflated size accepted
    pub max_output: usize,
}

impl Default for DeflateOptions {
    fn default() -> Self {
        Self {
            level: DEFAULT_COMPRESSION_LEVEL,
            max_output: MAX_PAYLOAD_SIZE,
        }
    }
}

/// Compress `data` into a raw deflate stream.
///
/// # Errors
/// Returns `ProtocolError::InvalidValue` if `level` is above 9 or the encoder
/// fails, which only happens when the output vector cannot grow.
pub fn compress(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let level = checked_level(level)?;
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2 + 16), level);
    encoder.write_all(data).map_err(compression_failed)?;
    encoder.finish().map_err(compression_failed)
}

/// Map a zlib-style level onto the encoder setting.
///
/// # Errors
/// `ProtocolError::InvalidValue` for levels above 9.
pub fn checked_level(level: u32) -> Result<Compression> {
    if level > MAX_COMPRESSION_LEVEL {
        return Err(ProtocolError::InvalidValue(format!(
            "{}: got {level}",
            constants::ERR_BAD_COMPRESSION_LEVEL
        )));
    }
    Ok(Compression::new(level))
}

fn compression_failed(e: std::io::Error) -> ProtocolError {
    ProtocolError::InvalidValue(format!("{}: {e}", constants::ERR_COMPRESSION_FAILED))
}

/// Inflate a raw deflate stream, refusing output larger than `max_output`.
///
/// # Errors
/// Returns `ProtocolError::CorruptPayload` if the stream is invalid or inflates
/// past the limit.
pub fn decompress(data: &[u8], max_output: usize) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::with_capacity(data.len().saturating_mul(3).min(max_output));
    let mut chunk = [0u8; 8192];
    loop {
        match decoder.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if out.len() + n > max_output {
                    return Err(ProtocolError::CorruptPayload(format!(
                        "inflated payload exceeds {max_output} bytes"
                    )));
                }
                out.extend_from_slice(&chunk[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProtocolError::CorruptPayload(format!("inflate failed: {e}"))),
        }
    }
    Ok(out)
}
