//! # Protocol Engine
//!
//! The wire-level pieces of the messaging protocol: frame flags and message
//! types, the frame codec, property encoding, in-flight message objects,
//! and the connection actor that ties them together.
//!
//! ## Wire Format
//!
//! Every transport message carries exactly one frame:
//!
//! ```text
//! varint(message number) | varint(flags) | payload bytes
//! ```
//!
//! The low three flag bits are the message type; the remaining bits mark
//! compression, urgency, noReply and moreComing. A message's payload is the
//! encoded property section followed by the body, split across as many
//! frames as the frame-size limit requires.

pub mod connection;
pub mod frame;
pub mod message;
pub mod properties;

pub use connection::{Connection, ConnectionDelegate, ConnectionOptions};
pub use frame::{Frame, FrameCodec};
pub use message::{MessageBuilder, MessageIn, ResponseResult};
pub use properties::Properties;

use crate::error::BlipError;
use std::fmt;

/// Maximum payload bytes carried by one frame unless configured otherwise.
pub const DEFAULT_FRAME_SIZE: usize = 4096;

/// WebSocket-style close status codes.
pub mod close_code {
    /// Orderly shutdown.
    pub const NORMAL: u16 = 1000;
    /// The peer violated the protocol.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// The connection dropped without a close handshake.
    pub const ABNORMAL: u16 = 1006;
}

/// The kind of message a frame belongs to, carried in the low three flag
/// bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Error = 2,
    AckRequest = 4,
    AckResponse = 5,
}

impl MessageType {
    pub(crate) fn from_bits(bits: u8) -> Result<MessageType, BlipError> {
        match bits {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::Response),
            2 => Ok(MessageType::Error),
            4 => Ok(MessageType::AckRequest),
            5 => Ok(MessageType::AckResponse),
            other => Err(BlipError::Protocol(format!(
                "unknown message type {other}"
            ))),
        }
    }

    /// Whether this is a progress-report frame rather than part of a
    /// message.
    pub fn is_ack(self) -> bool {
        matches!(self, MessageType::AckRequest | MessageType::AckResponse)
    }

    /// The ack type a receiver emits for a message of this type.
    pub(crate) fn ack(self) -> Option<MessageType> {
        match self {
            MessageType::Request => Some(MessageType::AckRequest),
            MessageType::Response | MessageType::Error => Some(MessageType::AckResponse),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Request => "REQ",
            MessageType::Response => "RES",
            MessageType::Error => "ERR",
            MessageType::AckRequest => "ACKREQ",
            MessageType::AckResponse => "ACKRES",
        };
        f.write_str(name)
    }
}

/// The flag byte of a frame: message type plus modifier bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    const TYPE_MASK: u8 = 0x07;
    pub const COMPRESSED: u8 = 0x08;
    pub const URGENT: u8 = 0x10;
    pub const NO_REPLY: u8 = 0x20;
    pub const MORE_COMING: u8 = 0x40;

    pub fn new(message_type: MessageType) -> FrameFlags {
        FrameFlags(message_type as u8)
    }

    /// Decode a flags varint. Values above one byte are rejected; the type
    /// bits are validated separately.
    pub fn from_bits(value: u64) -> Result<FrameFlags, BlipError> {
        if value > u8::MAX as u64 {
            return Err(BlipError::Protocol(format!(
                "frame flags out of range: {value:#x}"
            )));
        }
        Ok(FrameFlags(value as u8))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn message_type(self) -> Result<MessageType, BlipError> {
        MessageType::from_bits(self.0 & Self::TYPE_MASK)
    }

    pub fn contains(self, mask: u8) -> bool {
        self.0 & mask != 0
    }

    pub fn set(&mut self, mask: u8, on: bool) {
        if on {
            self.0 |= mask;
        } else {
            self.0 &= !mask;
        }
    }

    pub fn with(self, mask: u8, on: bool) -> FrameFlags {
        let mut flags = self;
        flags.set(mask, on);
        flags
    }

    pub fn is_compressed(self) -> bool {
        self.contains(Self::COMPRESSED)
    }

    pub fn is_urgent(self) -> bool {
        self.contains(Self::URGENT)
    }

    pub fn is_no_reply(self) -> bool {
        self.contains(Self::NO_REPLY)
    }

    pub fn more_coming(self) -> bool {
        self.contains(Self::MORE_COMING)
    }
}

impl fmt::Display for FrameFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message_type() {
            Ok(message_type) => write!(f, "{message_type}")?,
            Err(_) => write!(f, "TYPE?{}", self.0 & Self::TYPE_MASK)?,
        }
        if self.is_compressed() {
            write!(f, "|Z")?;
        }
        if self.is_urgent() {
            write!(f, "|URG")?;
        }
        if self.is_no_reply() {
            write!(f, "|NOREPLY")?;
        }
        if self.more_coming() {
            write!(f, "|MORE")?;
        }
        Ok(())
    }
}
