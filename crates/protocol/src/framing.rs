//! Packet framing with optional LZ4 compression.
//!
//! # Frame Format
//!
//! Each frame on the wire consists of:
//! - 4 bytes: body length (big-endian)
//! - N bytes: body
//!
//! Before keys are in effect the body is plaintext. Afterwards it is the
//! AEAD-sealed form of the plaintext body, which is:
//! - 1 byte: flags (bit 0 = compressed)
//! - M bytes: payload (possibly LZ4 compressed)
//!
//! # Compression
//!
//! When enabled, payloads larger than 1KB are compressed using LZ4 if that
//! actually makes them smaller.

use crate::error::{ProtocolError, Result};

/// Size of the length prefix.
pub const FRAME_LENGTH_SIZE: usize = 4;

/// Largest body carried in one frame (the AEAD message limit).
pub const MAX_BODY_SIZE: usize = 65535;

/// Authentication tag added to every sealed body.
pub const AEAD_TAG_SIZE: usize = 16;

/// Largest payload that fits a sealed body with its flags byte.
pub const MAX_PAYLOAD_SIZE: usize = MAX_BODY_SIZE - AEAD_TAG_SIZE - 1;

/// Compression threshold in bytes. Payloads larger than this are compressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Flags indicating frame properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Flag indicating the payload is LZ4 compressed.
    pub const COMPRESSED: u8 = 0b0000_0001;

    /// Create a new empty flags set.
    #[inline]
    pub fn new() -> Self {
        Self(0)
    }

    /// Create flags from a raw byte value.
    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Get the raw byte value of the flags.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Check if the compressed flag is set.
    #[inline]
    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    /// Return a new flags with compressed set or cleared.
    #[inline]
    pub fn with_compressed(mut self, compressed: bool) -> Self {
        if compressed {
            self.0 |= Self::COMPRESSED;
        } else {
            self.0 &= !Self::COMPRESSED;
        }
        self
    }
}

/// Encoder and decoder for frames and frame bodies.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    /// Whether to compress large payloads.
    compression_enabled: bool,
}

impl FrameCodec {
    /// Create a new frame codec with compression disabled.
    ///
    /// Compression is switched on once it has been negotiated.
    pub fn new() -> Self {
        Self {
            compression_enabled: false,
        }
    }

    /// Enable or disable compression for subsequently encoded bodies.
    pub fn set_compression(&mut self, enabled: bool) {
        self.compression_enabled = enabled;
    }

    /// Whether compression is currently applied to outgoing bodies.
    pub fn compression_enabled(&self) -> bool {
        self.compression_enabled
    }

    /// Build a plaintext body (`flags || payload`) from a payload.
    pub fn encode_body(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len() + 1,
                max: MAX_PAYLOAD_SIZE + 1,
            });
        }

        let should_compress = self.compression_enabled && payload.len() > COMPRESSION_THRESHOLD;

        let mut body = Vec::with_capacity(payload.len() + 1);
        if should_compress {
            let compressed = lz4_flex::compress_prepend_size(payload);
            // Only use compression if it actually reduces size
            if compressed.len() < payload.len() {
                body.push(FrameFlags::new().with_compressed(true).as_byte());
                body.extend_from_slice(&compressed);
                return Ok(body);
            }
        }

        body.push(FrameFlags::new().as_byte());
        body.extend_from_slice(payload);
        Ok(body)
    }

    /// Recover the payload from a plaintext body.
    pub fn decode_body(&self, body: &[u8]) -> Result<Vec<u8>> {
        let (&flags, payload) = body.split_first().ok_or_else(|| {
            ProtocolError::MalformedFrame("body must contain at least the flags byte".to_string())
        })?;

        let flags = FrameFlags::from_byte(flags);
        if !flags.is_compressed() {
            return Ok(payload.to_vec());
        }

        // lz4_flex prepends the uncompressed size as a little-endian u32
        if payload.len() < 4 {
            return Err(ProtocolError::MalformedFrame(
                "compressed payload too short".to_string(),
            ));
        }
        let claimed = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        if claimed > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: claimed,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        lz4_flex::decompress_size_prepended(payload).map_err(|e| {
            ProtocolError::MalformedFrame(format!("failed to decompress payload: {}", e))
        })
    }

    /// Prefix a (possibly sealed) body with its length.
    pub fn encode(&self, body: &[u8]) -> Result<Vec<u8>> {
        if body.is_empty() || body.len() > MAX_BODY_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max: MAX_BODY_SIZE,
            });
        }

        let mut output = Vec::with_capacity(FRAME_LENGTH_SIZE + body.len());
        output.extend_from_slice(&(body.len() as u32).to_be_bytes());
        output.extend_from_slice(body);
        Ok(output)
    }

    /// Try to decode a frame from bytes, returning None if there isn't enough data.
    ///
    /// On success returns the body and the number of bytes consumed. The
    /// call is resumable: feeding the same prefix again with more bytes
    /// appended yields the same result once the frame is complete.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
        if data.len() < FRAME_LENGTH_SIZE {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

        if body_len == 0 {
            return Err(ProtocolError::MalformedFrame(
                "zero-length frame".to_string(),
            ));
        }
        if body_len > MAX_BODY_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: body_len,
                max: MAX_BODY_SIZE,
            });
        }

        let total = FRAME_LENGTH_SIZE + body_len;
        if data.len() < total {
            return Ok(None);
        }

        Ok(Some((data[FRAME_LENGTH_SIZE..total].to_vec(), total)))
    }
}
