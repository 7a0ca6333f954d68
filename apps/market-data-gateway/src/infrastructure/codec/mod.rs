//! Message Codec
//!
//! Serializes and deserializes JSON wire frames, optionally compressing
//! them. Stateless; one codec per connection captures its compression.
//!
//! # Compression
//!
//! | Mode      | Outbound frame        | Inbound binary frame    |
//! |-----------|-----------------------|-------------------------|
//! | `none`    | text JSON             | raw JSON bytes          |
//! | `gzip`    | binary, gzip stream   | gunzip, then JSON       |
//! | `deflate` | binary, zlib stream   | inflate, then JSON      |
//!
//! Inbound text frames are always parsed as plain JSON. Decompressed
//! payloads are capped at [`MAX_FRAME_LEN`].

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use flate2::Compression as Level;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Upper bound on a decoded frame.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),

    /// Unknown compression name.
    #[error("unknown compression: {0}")]
    UnknownCompression(String),

    /// Decoded frame exceeded [`MAX_FRAME_LEN`].
    #[error("frame exceeds {MAX_FRAME_LEN} bytes")]
    FrameTooLarge,
}

// =============================================================================
// Compression
// =============================================================================

/// Per-connection frame compression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    /// Plain text frames.
    #[default]
    None,
    /// Gzip-compressed binary frames.
    Gzip,
    /// Zlib (RFC 1950) compressed binary frames.
    Deflate,
}

impl Compression {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "deflate" => Ok(Self::Deflate),
            other => Err(CodecError::UnknownCompression(other.to_string())),
        }
    }
}

// =============================================================================
// Frames
// =============================================================================

/// An encoded frame ready for a WebSocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
}

/// JSON codec with optional compression.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec {
    compression: Compression,
}

impl MessageCodec {
    /// Create a codec for the given compression.
    #[must_use]
    pub const fn new(compression: Compression) -> Self {
        Self { compression }
    }

    /// Compression in use.
    #[must_use]
    pub const fn compression(&self) -> Compression {
        self.compression
    }

    /// Encode a value into a wire frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or compression fails.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<WireFrame, CodecError> {
        let json = serde_json::to_string(value)?;
        match self.compression {
            Compression::None => Ok(WireFrame::Text(json)),
            _ => Ok(WireFrame::Binary(self.compress(json.as_bytes())?)),
        }
    }

    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid JSON for `T`.
    pub fn decode_text<T: DeserializeOwned>(&self, text: &str) -> Result<T, CodecError> {
        if text.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge);
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Decode a binary frame, decompressing it first when compression is on.
    ///
    /// # Errors
    ///
    /// Returns an error if decompression or JSON parsing fails.
    pub fn decode_binary<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let json = self.decompress(bytes)?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Compress raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoder fails.
    pub fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self.compression {
            Compression::None => Ok(bytes.to_vec()),
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Level::fast());
                encoder.write_all(bytes)?;
                Ok(encoder.finish()?)
            }
            Compression::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Level::fast());
                encoder.write_all(bytes)?;
                Ok(encoder.finish()?)
            }
        }
    }

    /// Decompress raw bytes, bounded by [`MAX_FRAME_LEN`].
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is corrupt or too large.
    pub fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self.compression {
            Compression::None => {
                if bytes.len() > MAX_FRAME_LEN {
                    return Err(CodecError::FrameTooLarge);
                }
                Ok(bytes.to_vec())
            }
            Compression::Gzip => read_bounded(GzDecoder::new(bytes)),
            Compression::Deflate => read_bounded(ZlibDecoder::new(bytes)),
        }
    }
}

fn read_bounded(reader: impl Read) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    reader.take(MAX_FRAME_LEN as u64 + 1).read_to_end(&mut out)?;
    if out.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge);
    }
    Ok(out)
}
