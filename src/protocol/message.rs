//! In-flight message objects.
//!
//! [`MessageBuilder`] assembles an outbound message; the connection turns it
//! into a [`MessageOut`], which owns the serialized payload and the
//! transmission cursor. Inbound frames reassemble into a [`MessageIn`],
//! which is immutable once complete and shared with user code behind an
//! `Arc`.

use crate::error::BlipError;
use crate::protocol::connection::ConnectionInner;
use crate::protocol::properties::Properties;
use crate::protocol::{FrameFlags, MessageType};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// What a response handler receives: the completed Response message, or an
/// error (an application error carried by an Error message, or a synthetic
/// close/cancel error).
pub type ResponseResult = Result<Arc<MessageIn>, BlipError>;

pub(crate) type ResponseHandler = Box<dyn FnOnce(ResponseResult) + Send + 'static>;

/// Accumulates the properties, body and flags of an outbound message.
///
/// Builders constructed by user code are always requests; response builders
/// are derived from an incoming request via [`MessageIn::respond`].
#[derive(Debug, Default)]
pub struct MessageBuilder {
    /// Grant this message priority in the outbound fairness policy.
    pub urgent: bool,
    /// Deflate the frame payloads (requires a codec on the connection).
    pub compressed: bool,
    /// Declare that no response will be accepted for this request.
    pub no_reply: bool,
    properties: Properties,
    body: Vec<u8>,
    pub(crate) message_type: Option<MessageType>,
}

impl MessageBuilder {
    pub fn new() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Convenience constructor for the common `Profile`-tagged request.
    pub fn with_profile(profile: &str) -> MessageBuilder {
        let mut builder = MessageBuilder::new();
        builder.add_property("Profile", profile);
        builder
    }

    pub(crate) fn of_type(message_type: MessageType) -> MessageBuilder {
        MessageBuilder {
            message_type: Some(message_type),
            ..MessageBuilder::default()
        }
    }

    pub fn add_property(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut MessageBuilder {
        self.properties.add(name, value);
        self
    }

    /// Append a chunk to the message body.
    pub fn append_body(&mut self, chunk: &[u8]) -> &mut MessageBuilder {
        self.body.extend_from_slice(chunk);
        self
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// An outbound message owned by the connection actor while it transmits.
pub(crate) struct MessageOut {
    pub(crate) number: u64,
    flags: FrameFlags,
    payload: Vec<u8>,
    cursor: usize,
    frames_sent: u64,
}

impl MessageOut {
    /// Serialize a finalized builder: property section followed by the body.
    pub(crate) fn from_builder(builder: MessageBuilder) -> Result<MessageOut, BlipError> {
        let message_type = builder.message_type.unwrap_or(MessageType::Request);
        let mut flags = FrameFlags::new(message_type);
        flags.set(FrameFlags::URGENT, builder.urgent);
        flags.set(FrameFlags::COMPRESSED, builder.compressed);
        flags.set(FrameFlags::NO_REPLY, builder.no_reply);
        let mut payload = Vec::with_capacity(builder.body.len() + 64);
        builder.properties.encode(&mut payload)?;
        payload.extend_from_slice(&builder.body);
        Ok(MessageOut {
            number: 0,
            flags,
            payload,
            cursor: 0,
            frames_sent: 0,
        })
    }

    /// Advance the cursor by up to `max_len` bytes and return the flags and
    /// payload of the next frame. `MORE_COMING` is set while bytes remain.
    pub(crate) fn next_frame(&mut self, max_len: usize) -> (FrameFlags, &[u8]) {
        let start = self.cursor;
        let end = (start + max_len.max(1)).min(self.payload.len());
        self.cursor = end;
        self.frames_sent += 1;
        let more = end < self.payload.len();
        (
            self.flags.with(FrameFlags::MORE_COMING, more),
            &self.payload[start..end],
        )
    }

    /// Whether every byte has been handed out. A message always emits at
    /// least one frame, even with an empty payload.
    pub(crate) fn is_finished(&self) -> bool {
        self.frames_sent > 0 && self.cursor >= self.payload.len()
    }

    pub(crate) fn message_type(&self) -> MessageType {
        // The type bits were set from a valid MessageType in from_builder.
        self.flags.message_type().unwrap_or(MessageType::Request)
    }

    pub(crate) fn is_urgent(&self) -> bool {
        self.flags.is_urgent()
    }

    pub(crate) fn no_reply(&self) -> bool {
        self.flags.is_no_reply()
    }

    pub(crate) fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Ordering key for the outbound fairness policy: urgent messages come
    /// first; within a class the message with the fewest frames sent wins,
    /// with the lowest number breaking ties.
    pub(crate) fn fairness_key(&self) -> (bool, u64, u64) {
        (!self.is_urgent(), self.frames_sent, self.number)
    }
}

/// A completed inbound message, shared read-only with user code.
pub struct MessageIn {
    number: u64,
    message_type: MessageType,
    flags: FrameFlags,
    properties: Properties,
    body: Vec<u8>,
    responded: AtomicBool,
    connection: Weak<ConnectionInner>,
}

impl MessageIn {
    pub(crate) fn new(
        number: u64,
        message_type: MessageType,
        flags: FrameFlags,
        properties: Properties,
        body: Vec<u8>,
        connection: Weak<ConnectionInner>,
    ) -> MessageIn {
        MessageIn {
            number,
            message_type,
            flags,
            properties,
            body,
            responded: AtomicBool::new(false),
            connection,
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn no_reply(&self) -> bool {
        self.flags.is_no_reply()
    }

    pub fn is_urgent(&self) -> bool {
        self.flags.is_urgent()
    }

    pub fn is_error(&self) -> bool {
        self.message_type == MessageType::Error
    }

    /// Queue a Response message carrying this request's number.
    ///
    /// Errors when the message is not a request, was flagged noReply, or has
    /// already been responded to.
    pub fn respond(&self, builder: MessageBuilder) -> Result<(), BlipError> {
        self.queue_reply(builder, MessageType::Response)
    }

    /// Queue an Error response with the conventional `Error-Domain` /
    /// `Error-Code` properties and the message text as body.
    pub fn respond_with_error(
        &self,
        domain: &str,
        code: i64,
        message: &str,
    ) -> Result<(), BlipError> {
        let mut builder = MessageBuilder::new();
        builder.add_property("Error-Domain", domain);
        builder.add_property("Error-Code", code.to_string());
        builder.append_body(message.as_bytes());
        self.queue_reply(builder, MessageType::Error)
    }

    fn queue_reply(
        &self,
        mut builder: MessageBuilder,
        message_type: MessageType,
    ) -> Result<(), BlipError> {
        if self.message_type != MessageType::Request || self.no_reply() {
            return Err(BlipError::NoResponsePossible);
        }
        if self.responded.swap(true, Ordering::SeqCst) {
            return Err(BlipError::AlreadyResponded);
        }
        let connection = self
            .connection
            .upgrade()
            .ok_or(BlipError::ConnectionClosed)?;
        builder.message_type = Some(message_type);
        builder.no_reply = true;
        let mut reply = MessageOut::from_builder(builder)?;
        reply.number = self.number;
        connection.submit_outbound(reply, None);
        Ok(())
    }

    /// Flag the message as responded to. Returns `true` when this call made
    /// the transition.
    pub(crate) fn mark_responded(&self) -> bool {
        !self.responded.swap(true, Ordering::SeqCst)
    }

    /// The application error carried by an Error message.
    pub fn application_error(&self) -> BlipError {
        let domain = self
            .properties
            .get("Error-Domain")
            .unwrap_or("BLIP")
            .to_string();
        let code = self
            .properties
            .get("Error-Code")
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let message = String::from_utf8_lossy(&self.body).into_owned();
        BlipError::Application {
            domain,
            code,
            message,
        }
    }
}

impl fmt::Debug for MessageIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageIn")
            .field("number", &self.number)
            .field("type", &self.message_type)
            .field("properties", &self.properties.len())
            .field("body_len", &self.body.len())
            .finish()
    }
}
