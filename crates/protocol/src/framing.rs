//! Frame codec for envelopes crossing the shared transport.
//!
//! # Frame Format
//!
//! - 4 bytes: magic `TGWY`
//! - 4 bytes: content length (big-endian, flags byte included)
//! - 1 byte: flags (bit 0 = LZ4 compressed)
//! - N bytes: MessagePack envelope, possibly compressed
//!
//! Envelopes above [`COMPRESSION_THRESHOLD`] bytes are LZ4 compressed when
//! the codec has compression enabled and doing so actually shrinks them.

use crate::error::{ProtocolError, Result};
use crate::messages::{Envelope, PROTOCOL_VERSION};

/// Magic bytes opening every termgate frame.
pub const FRAME_MAGIC: [u8; 4] = *b"TGWY";

/// Payloads strictly larger than this are candidates for compression.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Maximum encoded frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Magic + length + flags.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Bytes preceding the flags byte.
const PREFIX_SIZE: usize = 8;

/// Per-frame flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Payload is LZ4 compressed with a prepended size.
    pub const COMPRESSED: u8 = 0b0000_0001;

    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    pub fn as_byte(self) -> u8 {
        self.0
    }

    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    pub fn compressed() -> Self {
        Self(Self::COMPRESSED)
    }
}

/// A decoded frame; `payload` is always in uncompressed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: FrameFlags,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            flags: FrameFlags::default(),
            payload,
        }
    }
}

/// Encoder and decoder for frames and the envelopes they carry.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    compression: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec with compression enabled.
    pub fn new() -> Self {
        Self { compression: true }
    }

    /// Codec that never compresses (it still decodes compressed frames).
    pub fn without_compression() -> Self {
        Self { compression: false }
    }

    /// Codec with compression set from configuration.
    pub fn with_compression(compression: bool) -> Self {
        Self { compression }
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression
    }

    /// Encode a frame into wire bytes.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let payload = &frame.payload;
        if payload.len() > MAX_FRAME_SIZE - FRAME_HEADER_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len() + FRAME_HEADER_SIZE,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut flags = FrameFlags::default();
        let mut compressed = None;
        if self.compression && payload.len() > COMPRESSION_THRESHOLD {
            let candidate = lz4_flex::compress_prepend_size(payload);
            if candidate.len() < payload.len() {
                flags = FrameFlags::compressed();
                compressed = Some(candidate);
            }
        }
        let body = compressed.as_deref().unwrap_or(payload);

        let content_len = 1 + body.len();
        let mut out = Vec::with_capacity(PREFIX_SIZE + content_len);
        out.extend_from_slice(&FRAME_MAGIC);
        out.extend_from_slice(&(content_len as u32).to_be_bytes());
        out.push(flags.as_byte());
        out.extend_from_slice(body);
        Ok(out)
    }

    /// Decode one frame from the start of `data`.
    ///
    /// Returns the frame and the number of bytes consumed. Incomplete input
    /// is an error; use [`FrameCodec::try_decode`] for streaming buffers.
    pub fn decode(&self, data: &[u8]) -> Result<(Frame, usize)> {
        match self.try_decode(data)? {
            Some(decoded) => Ok(decoded),
            None => Err(ProtocolError::Deserialization(format!(
                "insufficient data for frame: have {} bytes",
                data.len()
            ))),
        }
    }

    /// Decode one frame if `data` holds a complete one.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Frame, usize)>> {
        let Some(content_len) = read_header(data)? else {
            return Ok(None);
        };
        let total = PREFIX_SIZE + content_len;
        if data.len() < total {
            return Ok(None);
        }

        let flags = FrameFlags::from_byte(data[PREFIX_SIZE]);
        let body = &data[FRAME_HEADER_SIZE..total];
        let payload = if flags.is_compressed() {
            lz4_flex::decompress_size_prepended(body).map_err(|e| {
                ProtocolError::Deserialization(format!("failed to decompress payload: {e}"))
            })?
        } else {
            body.to_vec()
        };

        Ok(Some((Frame::new(payload), total)))
    }

    /// Serialize an envelope and wrap it in a frame.
    pub fn encode_envelope(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let bytes = envelope.to_msgpack()?;
        self.encode(&Frame::new(bytes))
    }

    /// Decode a single complete frame into an envelope.
    ///
    /// Envelopes from a different protocol version are rejected.
    pub fn decode_envelope(&self, data: &[u8]) -> Result<Envelope> {
        let (frame, consumed) = self.decode(data)?;
        if consumed != data.len() {
            return Err(ProtocolError::Deserialization(format!(
                "{} trailing bytes after frame",
                data.len() - consumed
            )));
        }
        let envelope = Envelope::from_msgpack(&frame.payload)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                got: envelope.version,
                expected: PROTOCOL_VERSION,
            });
        }
        Ok(envelope)
    }
}

/// Validate the fixed header and return the content length.
///
/// `Ok(None)` means the header itself is not complete yet.
fn read_header(data: &[u8]) -> Result<Option<usize>> {
    if data.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&data[..4]);
    if magic != FRAME_MAGIC {
        return Err(ProtocolError::InvalidFrameMagic {
            expected: u32::from_be_bytes(FRAME_MAGIC),
            got: u32::from_be_bytes(magic),
        });
    }

    let mut len = [0u8; 4];
    len.copy_from_slice(&data[4..PREFIX_SIZE]);
    let content_len = u32::from_be_bytes(len) as usize;
    if PREFIX_SIZE + content_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: PREFIX_SIZE + content_len,
            max: MAX_FRAME_SIZE,
        });
    }
    if content_len == 0 {
        return Err(ProtocolError::Deserialization(
            "frame content must include the flags byte".to_string(),
        ));
    }
    Ok(Some(content_len))
}
