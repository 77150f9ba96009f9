//! Deflate compression for message payloads.
//!
//! Large payloads are deflated before transmission and flagged in the message
//! header; small payloads skip compression to avoid overhead.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

use crate::packet::MAX_PACKET_SIZE;

/// Errors that can occur while inflating a payload.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CompressionError {
    /// The deflate stream was corrupt or truncated.
    #[error("corrupt deflate stream: {0}")]
    Corrupt(String),

    /// The inflated payload would exceed the largest packet body.
    #[error("inflated payload exceeds {0} bytes")]
    TooLarge(usize),
}

/// Deflate `data` at the default compression level.
pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    // Writing into a Vec cannot fail.
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

/// Inflate a deflate stream produced by [`deflate`].
pub fn inflate(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let limit = MAX_PACKET_SIZE as u64;
    let mut decoder = DeflateDecoder::new(data).take(limit + 1);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CompressionError::Corrupt(e.to_string()))?;
    if out.len() as u64 > limit {
        return Err(CompressionError::TooLarge(MAX_PACKET_SIZE));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repetitive_payload_shrinks() {
        let data = vec![7u8; 4096];
        let packed = deflate(&data);
        assert!(packed.len() < data.len() / 4);
        assert_eq!(inflate(&packed).unwrap(), data);
    }

    #[test]
    fn test_empty_payload() {
        let packed = deflate(&[]);
        assert_eq!(inflate(&packed).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_corrupt_stream_is_an_error() {
        let result = inflate(&[0xFF, 0xFE, 0xFD, 0xFC, 0x00, 0x13]);
        assert!(matches!(result, Err(CompressionError::Corrupt(_))));
    }
}
