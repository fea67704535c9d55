//! Frame encoding and decoding.
//!
//! A frame is `varint(number) | varint(flags) | payload`. Frame boundaries
//! come from the transport (one transport message per frame), so the codec
//! never searches for delimiters. Compression state is per-connection and
//! per-direction: compressed frames from interleaved messages must pass
//! through the codec in arrival order.

use crate::error::BlipError;
use crate::protocol::FrameFlags;
use std::io;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub number: u64,
    pub flags: FrameFlags,
    pub payload: Vec<u8>,
}

/// Outbound payload transform for frames with the compressed flag.
///
/// Implementations may keep dictionary state across calls; the codec feeds
/// them frames strictly in send order.
pub trait Compressor: Send {
    fn compress(&mut self, data: &[u8]) -> io::Result<Vec<u8>>;
}

/// Inbound counterpart of [`Compressor`], fed frames in arrival order.
pub trait Decompressor: Send {
    fn decompress(&mut self, data: &[u8]) -> io::Result<Vec<u8>>;
}

/// Append `value` as an unsigned LEB128 varint.
pub fn put_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            buf.push(byte | 0x80);
        } else {
            buf.push(byte);
            return;
        }
    }
}

/// Decode an unsigned LEB128 varint, returning the value and the number of
/// bytes consumed.
pub fn get_uvarint(data: &[u8]) -> Result<(u64, usize), BlipError> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return Err(BlipError::Protocol("varint too long".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(BlipError::Protocol("truncated varint".into()))
}

/// Stateful frame encoder/decoder for one connection.
///
/// Holds the optional per-direction compression transforms. A frame flagged
/// compressed fails to encode or decode when the corresponding transform was
/// not configured.
pub struct FrameCodec {
    compressor: Option<Box<dyn Compressor>>,
    decompressor: Option<Box<dyn Decompressor>>,
}

impl FrameCodec {
    pub fn new() -> FrameCodec {
        FrameCodec {
            compressor: None,
            decompressor: None,
        }
    }

    pub fn with_compression(
        compressor: Box<dyn Compressor>,
        decompressor: Box<dyn Decompressor>,
    ) -> FrameCodec {
        FrameCodec {
            compressor: Some(compressor),
            decompressor: Some(decompressor),
        }
    }

    /// Encode one frame into a transport message.
    pub fn encode(
        &mut self,
        number: u64,
        flags: FrameFlags,
        payload: &[u8],
    ) -> Result<Vec<u8>, BlipError> {
        let mut buf = Vec::with_capacity(payload.len() + 12);
        put_uvarint(&mut buf, number);
        put_uvarint(&mut buf, u64::from(flags.bits()));
        if flags.is_compressed() {
            let compressor = self
                .compressor
                .as_mut()
                .ok_or_else(|| BlipError::Protocol("compressed frame but no compressor".into()))?;
            let compressed = compressor
                .compress(payload)
                .map_err(|e| BlipError::Protocol(format!("compression failed: {e}")))?;
            buf.extend_from_slice(&compressed);
        } else {
            buf.extend_from_slice(payload);
        }
        Ok(buf)
    }

    /// Decode one transport message into a frame.
    pub fn decode(&mut self, data: &[u8]) -> Result<Frame, BlipError> {
        let (number, used) = get_uvarint(data)?;
        let (flag_bits, flags_used) = get_uvarint(&data[used..])?;
        let flags = FrameFlags::from_bits(flag_bits)?;
        let raw = &data[used + flags_used..];
        let payload = if flags.is_compressed() {
            let decompressor = self.decompressor.as_mut().ok_or_else(|| {
                BlipError::Protocol("compressed frame but no decompressor".into())
            })?;
            decompressor
                .decompress(raw)
                .map_err(|e| BlipError::Protocol(format!("decompression failed: {e}")))?
        } else {
            raw.to_vec()
        };
        Ok(Frame {
            number,
            flags,
            payload,
        })
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
