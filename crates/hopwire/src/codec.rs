//! Frame codec — JSON envelope encoding and deflate compression.
//!
//! Every frame on the wire is the JSON encoding of a [`PipeFrame`]
//! (a self-describing `{"type": ..., "data": ...}` envelope), run
//! through a zlib deflate at the fastest setting. Encoding and
//! compression failures are kept distinct: corrupt bytes that cannot
//! be inflated are a [`ExchangeError::Decompression`], inflated bytes
//! that do not parse are a [`ExchangeError::Serialization`].

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::ExchangeError;
use crate::message::PipeFrame;

/// Serialize a frame to its JSON envelope.
pub fn frame_to_bytes(frame: &PipeFrame) -> Result<Vec<u8>, ExchangeError> {
    Ok(serde_json::to_vec(frame)?)
}

/// Parse a JSON envelope back into a frame.
///
/// Fails with [`ExchangeError::Serialization`] when the bytes do not form
/// a valid envelope or name an unknown discriminator.
pub fn bytes_to_frame(bytes: &[u8]) -> Result<PipeFrame, ExchangeError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Compress bytes with deflate at the fastest setting.
pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, ExchangeError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Decompress bytes, reading the inflated stream in chunks so no
/// assumption is made about the output size.
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, ExchangeError> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ExchangeError::Decompression(e.to_string()))?;
    Ok(out)
}

/// Encode a frame for transmission: JSON envelope, then compression.
pub fn encode(frame: &PipeFrame) -> Result<Vec<u8>, ExchangeError> {
    compress(&frame_to_bytes(frame)?)
}

/// Decode received bytes: decompression, then envelope parsing.
pub fn decode(bytes: &[u8]) -> Result<PipeFrame, ExchangeError> {
    bytes_to_frame(&decompress(bytes)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
