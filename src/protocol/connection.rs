//! # Connection
//!
//! The protocol engine. All mutable protocol state lives on one actor (the
//! I/O actor), so there are no locks around protocol data: user calls and
//! transport callbacks enqueue closures onto the connection's mailbox, and
//! the mailbox serializes them.
//!
//! ## Outbound path
//!
//! `send_request` hands a serialized [`MessageOut`] to the I/O actor, which
//! assigns the next request number, registers the response handler (unless
//! the request is noReply) and pushes the message into the outbound queue.
//! The writer emits one frame per mailbox turn, picking the next message by
//! the fairness policy: urgent messages first, then the message with the
//! fewest frames sent, lowest number breaking ties. Interleaving frames
//! this way bounds head-of-line blocking; yielding between frames keeps the
//! inbound path responsive. When the transport reports itself unwriteable
//! the writer stops and resumes on the `on_writeable` callback.
//!
//! ## Inbound path
//!
//! Each transport message decodes to one frame, which is routed to the
//! incomplete message it continues (or starts). Request numbers and
//! response numbers are separate spaces, one per sender direction, so
//! incomplete requests and incomplete responses live in separate maps. A
//! continuation whose type disagrees with its first frame is a protocol
//! error and closes the connection with status 1002. When the terminal
//! frame arrives the message is dispatched: requests go to the delegate
//! (with an automatic empty Response if the delegate does not respond),
//! responses and errors resolve the pending handler registered at send
//! time.

use crate::actor::{Actor, Scheduler};
use crate::error::BlipError;
use crate::protocol::frame::{Frame, FrameCodec};
use crate::protocol::message::{
    MessageBuilder, MessageIn, MessageOut, ResponseHandler, ResponseResult,
};
use crate::protocol::properties::Properties;
use crate::protocol::{close_code, FrameFlags, MessageType, DEFAULT_FRAME_SIZE};
use crate::transport::{Transport, TransportObserver};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};

/// Connection-level events, delivered on the connection's I/O actor.
///
/// Every method except `on_request_received` has a default no-op body, so a
/// delegate implements only the capabilities it cares about.
pub trait ConnectionDelegate: Send + Sync + 'static {
    /// The transport opened; requests can now flow.
    fn on_connect(&self) {}

    /// A non-fatal transport or protocol error notification. May precede
    /// `on_close`.
    fn on_error(&self, _code: i32, _reason: &str) {}

    /// The connection reached its terminal state. Called exactly once.
    fn on_close(&self, _status: u16, _reason: &str) {}

    /// A complete request arrived from the peer. Call
    /// [`MessageIn::respond`] to answer it; returning without responding
    /// sends an empty success Response unless the request was noReply.
    fn on_request_received(&self, msg: &Arc<MessageIn>);

    /// Observer hook: a complete response or error arrived. The handler
    /// registered with the request remains the primary delivery path.
    fn on_response_received(&self, _msg: &Arc<MessageIn>) {}
}

/// Tunables for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Maximum payload bytes per frame.
    pub frame_size: usize,
    /// Emit an empty AckRequest/AckResponse frame after dispatching each
    /// completed message. Progress reporting only; peers ignore acks they
    /// do not care about.
    pub acknowledge: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            frame_size: DEFAULT_FRAME_SIZE,
            acknowledge: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unopened,
    Open,
    Closing,
    Closed,
}

/// A bidirectional, multiplexed request/response connection over a
/// message-oriented transport.
///
/// Cloning the handle is cheap; all clones drive the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    weak_self: Weak<ConnectionInner>,
    name: String,
    actor: Actor<ConnectionState>,
    transport: Arc<dyn Transport>,
    delegate: Arc<dyn ConnectionDelegate>,
}

struct ConnectionState {
    phase: Phase,
    options: ConnectionOptions,
    codec: FrameCodec,
    outbox: Outbox,
    next_number: u64,
    response_handlers: HashMap<u64, ResponseHandler>,
    incoming_requests: HashMap<u64, PendingIn>,
    incoming_responses: HashMap<u64, PendingIn>,
    writer_scheduled: bool,
}

impl Connection {
    /// Create a connection over `transport`, reporting events to
    /// `delegate`, running on `scheduler`.
    ///
    /// The transport's `on_open` callback moves the connection into the
    /// open state and triggers `on_connect`.
    pub fn new(
        transport: Arc<dyn Transport>,
        delegate: Arc<dyn ConnectionDelegate>,
        scheduler: &Arc<Scheduler>,
        options: ConnectionOptions,
    ) -> Connection {
        Self::new_with_codec(transport, delegate, scheduler, options, FrameCodec::new())
    }

    /// Like [`Connection::new`] with an explicit frame codec, for
    /// connections that negotiate payload compression.
    pub fn new_with_codec(
        transport: Arc<dyn Transport>,
        delegate: Arc<dyn ConnectionDelegate>,
        scheduler: &Arc<Scheduler>,
        options: ConnectionOptions,
        codec: FrameCodec,
    ) -> Connection {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let name = format!("bmp#{}", NEXT_ID.fetch_add(1, Ordering::Relaxed));
        let state = ConnectionState {
            phase: Phase::Unopened,
            options,
            codec,
            outbox: Outbox::default(),
            next_number: 1,
            response_handlers: HashMap::new(),
            incoming_requests: HashMap::new(),
            incoming_responses: HashMap::new(),
            writer_scheduled: false,
        };
        let inner = Arc::new_cyclic(|weak| ConnectionInner {
            weak_self: weak.clone(),
            actor: Actor::new(name.clone(), scheduler, state),
            name,
            transport: Arc::clone(&transport),
            delegate,
        });
        transport.connect(Arc::new(ConnectionObserver {
            inner: Arc::downgrade(&inner),
        }));
        Connection { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Send a request without registering a response handler. Any response
    /// the peer sends is discarded; use this for noReply requests or when
    /// the response does not matter.
    pub fn send_request(&self, builder: MessageBuilder) -> Result<(), BlipError> {
        self.submit(builder, None)
    }

    /// Send a request and deliver its outcome to `on_response`: the
    /// Response message, the application error from an Error message, or a
    /// synthetic error if the connection closes first. The handler runs on
    /// the connection's I/O actor, exactly once.
    pub fn send_request_with(
        &self,
        builder: MessageBuilder,
        on_response: impl FnOnce(ResponseResult) + Send + 'static,
    ) -> Result<(), BlipError> {
        self.submit(builder, Some(Box::new(on_response)))
    }

    fn submit(
        &self,
        builder: MessageBuilder,
        handler: Option<ResponseHandler>,
    ) -> Result<(), BlipError> {
        if builder.no_reply && handler.is_some() {
            return Err(BlipError::NoResponsePossible);
        }
        let message = MessageOut::from_builder(builder)?;
        self.inner.submit_outbound(message, handler);
        Ok(())
    }

    /// Close the connection with a normal status.
    pub fn close(&self) {
        self.close_with(close_code::NORMAL, "");
    }

    /// Close the connection. Unsent outbound messages are dropped and every
    /// pending response handler is cancelled with
    /// [`BlipError::CancelledByClose`].
    pub fn close_with(&self, status: u16, reason: &str) {
        let reason = reason.to_string();
        self.inner
            .dispatch(move |inner, state| inner.begin_close(state, status, &reason));
    }

    /// Number of sent requests still waiting for a response. Diagnostics
    /// only; must not be called from the connection's own actor.
    pub fn pending_response_count(&self) -> usize {
        self.inner
            .actor
            .inspect(|state| state.response_handlers.len())
    }

    /// Log the I/O actor's mailbox statistics.
    pub fn log_stats(&self) {
        self.inner.actor.mailbox().log_stats();
    }
}

impl ConnectionInner {
    /// Run `f` on the I/O actor with the connection and its state.
    fn dispatch<F>(&self, f: F)
    where
        F: FnOnce(&Arc<ConnectionInner>, &mut ConnectionState) + Send + 'static,
    {
        let Some(inner) = self.weak_self.upgrade() else {
            return;
        };
        self.actor.enqueue(move |state| f(&inner, state));
    }

    pub(crate) fn submit_outbound(&self, message: MessageOut, handler: Option<ResponseHandler>) {
        self.dispatch(move |inner, state| inner.queue_outbound(state, message, handler));
    }

    fn queue_outbound(
        &self,
        state: &mut ConnectionState,
        mut message: MessageOut,
        handler: Option<ResponseHandler>,
    ) {
        if matches!(state.phase, Phase::Closing | Phase::Closed) {
            debug!(connection = %self.name, "dropping outbound message queued after close");
            if let Some(handler) = handler {
                handler(Err(BlipError::CancelledByClose));
            }
            return;
        }
        if message.number == 0 {
            // Outbound request: assign the next number in our direction.
            // Numbers are strictly increasing and never reused.
            message.number = state.next_number;
            state.next_number += 1;
            if !message.no_reply() {
                if let Some(handler) = handler {
                    state.response_handlers.insert(message.number, handler);
                }
            }
        }
        trace!(
            connection = %self.name,
            number = message.number,
            message_type = %message.message_type(),
            "queued outbound message"
        );
        state.outbox.push(message);
        self.maybe_write(state);
    }

    /// Schedule one writer turn if there is work, the transport can take
    /// it, and no writer turn is already queued.
    fn maybe_write(&self, state: &mut ConnectionState) {
        if state.writer_scheduled
            || state.phase != Phase::Open
            || state.outbox.is_empty()
            || !self.transport.is_writeable()
        {
            return;
        }
        state.writer_scheduled = true;
        self.dispatch(|inner, state| {
            state.writer_scheduled = false;
            inner.write_next_frame(state);
        });
    }

    /// Emit one frame of the next message per the fairness policy.
    fn write_next_frame(&self, state: &mut ConnectionState) {
        if state.phase != Phase::Open || !self.transport.is_writeable() {
            return;
        }
        let Some(index) = state.outbox.next_index() else {
            return;
        };
        let frame_size = state.options.frame_size;
        let (number, flags, finished, encoded) = {
            // Split borrows: the frame chunk borrows the outbox while the
            // codec encodes it.
            let ConnectionState { outbox, codec, .. } = &mut *state;
            let message = outbox.get_mut(index);
            let number = message.number;
            let (flags, chunk) = message.next_frame(frame_size);
            let encoded = codec.encode(number, flags, chunk);
            let finished = message.is_finished();
            (number, flags, finished, encoded)
        };
        let encoded = match encoded {
            Ok(bytes) => bytes,
            Err(e) => {
                return self.protocol_failure(state, format!("failed to encode frame: {e}"));
            }
        };
        trace!(
            connection = %self.name,
            number,
            flags = %flags,
            bytes = encoded.len(),
            "frame out"
        );
        if let Err(e) = self.transport.send(encoded) {
            return self.transport_failure(state, &e.to_string());
        }
        if finished {
            // Requests that expect a response live on only as their entry
            // in the pending-response map; noReply requests and responses
            // are released here.
            let message = state.outbox.remove(index);
            debug!(
                connection = %self.name,
                number = message.number,
                frames = message.frames_sent(),
                "message fully sent"
            );
        }
        self.maybe_write(state);
    }

    fn handle_open(&self, state: &mut ConnectionState) {
        if state.phase != Phase::Unopened {
            return;
        }
        state.phase = Phase::Open;
        debug!(connection = %self.name, "transport open");
        self.delegate.on_connect();
        self.maybe_write(state);
    }

    fn handle_inbound(&self, state: &mut ConnectionState, data: Vec<u8>) {
        if state.phase == Phase::Closed {
            return;
        }
        let frame = match state.codec.decode(&data) {
            Ok(frame) => frame,
            Err(e) => return self.protocol_failure(state, e.to_string()),
        };
        let message_type = match frame.flags.message_type() {
            Ok(message_type) => message_type,
            Err(e) => return self.protocol_failure(state, e.to_string()),
        };
        trace!(
            connection = %self.name,
            number = frame.number,
            flags = %frame.flags,
            bytes = frame.payload.len(),
            "frame in"
        );
        if message_type.is_ack() {
            // Receiver-driven progress report; no protocol obligation.
            trace!(connection = %self.name, number = frame.number, "ack received");
            return;
        }
        self.reassemble(state, frame, message_type);
    }

    fn reassemble(&self, state: &mut ConnectionState, frame: Frame, message_type: MessageType) {
        enum Step {
            Continuing,
            Completed(PendingIn),
            Mismatch(MessageType),
        }
        let step = {
            // Requests are numbered by the peer, responses by us; the two
            // number spaces are distinct and reassemble independently.
            let map = match message_type {
                MessageType::Request => &mut state.incoming_requests,
                _ => &mut state.incoming_responses,
            };
            match map.entry(frame.number) {
                Entry::Vacant(entry) => {
                    let mut pending = PendingIn::new(frame.number, message_type, frame.flags);
                    pending.append(&frame.payload);
                    if frame.flags.more_coming() {
                        entry.insert(pending);
                        Step::Continuing
                    } else {
                        Step::Completed(pending)
                    }
                }
                Entry::Occupied(mut entry) => {
                    if entry.get().message_type != message_type {
                        Step::Mismatch(entry.get().message_type)
                    } else {
                        entry.get_mut().append(&frame.payload);
                        if frame.flags.more_coming() {
                            Step::Continuing
                        } else {
                            Step::Completed(entry.remove())
                        }
                    }
                }
            }
        };
        match step {
            Step::Continuing => {}
            Step::Mismatch(expected) => self.protocol_failure(
                state,
                format!(
                    "continuation frame for message {} has type {} but the message began as {}",
                    frame.number, message_type, expected
                ),
            ),
            Step::Completed(pending) => self.dispatch_complete(state, pending),
        }
    }

    fn dispatch_complete(&self, state: &mut ConnectionState, pending: PendingIn) {
        let message = match pending.into_message(self) {
            Ok(message) => Arc::new(message),
            Err(e) => return self.protocol_failure(state, e.to_string()),
        };
        let message_type = message.message_type();
        debug!(
            connection = %self.name,
            number = message.number(),
            message_type = %message_type,
            bytes = message.body().len(),
            "message received"
        );
        match message_type {
            MessageType::Request => {
                let delegate = Arc::clone(&self.delegate);
                let outcome =
                    catch_unwind(AssertUnwindSafe(|| delegate.on_request_received(&message)));
                if outcome.is_err() {
                    warn!(
                        connection = %self.name,
                        number = message.number(),
                        "delegate panicked handling request"
                    );
                }
                if !message.no_reply() && message.mark_responded() {
                    // The delegate returned without responding: send an
                    // empty success Response so the peer's handler fires.
                    self.send_empty_response(state, message.number());
                }
            }
            MessageType::Response => {
                self.delegate.on_response_received(&message);
                match state.response_handlers.remove(&message.number()) {
                    Some(handler) => handler(Ok(Arc::clone(&message))),
                    None => debug!(
                        connection = %self.name,
                        number = message.number(),
                        "discarding response with no pending handler"
                    ),
                }
            }
            MessageType::Error => {
                self.delegate.on_response_received(&message);
                match state.response_handlers.remove(&message.number()) {
                    Some(handler) => handler(Err(message.application_error())),
                    None => debug!(
                        connection = %self.name,
                        number = message.number(),
                        "discarding error with no pending handler"
                    ),
                }
            }
            MessageType::AckRequest | MessageType::AckResponse => unreachable!("acks filtered"),
        }
        if state.options.acknowledge {
            if let Some(ack_type) = message_type.ack() {
                self.send_ack(state, ack_type, message.number());
            }
        }
    }

    fn send_empty_response(&self, state: &mut ConnectionState, number: u64) {
        let mut builder = MessageBuilder::of_type(MessageType::Response);
        builder.no_reply = true;
        match MessageOut::from_builder(builder) {
            Ok(mut reply) => {
                reply.number = number;
                self.queue_outbound(state, reply, None);
            }
            Err(e) => warn!(connection = %self.name, "failed to build empty response: {e}"),
        }
    }

    /// Acks bypass the outbound queue: they are single empty frames and
    /// must not wait behind bulk message traffic.
    fn send_ack(&self, state: &mut ConnectionState, ack_type: MessageType, number: u64) {
        let flags = FrameFlags::new(ack_type).with(FrameFlags::NO_REPLY, true);
        match state.codec.encode(number, flags, &[]) {
            Ok(bytes) => {
                if let Err(e) = self.transport.send(bytes) {
                    self.transport_failure(state, &e.to_string());
                }
            }
            Err(e) => warn!(connection = %self.name, "failed to encode ack: {e}"),
        }
    }

    fn begin_close(&self, state: &mut ConnectionState, status: u16, reason: &str) {
        if matches!(state.phase, Phase::Closing | Phase::Closed) {
            return;
        }
        debug!(connection = %self.name, status, reason, "closing");
        state.phase = Phase::Closing;
        state.outbox.clear();
        self.cancel_pending(state);
        self.transport.close(status, reason);
    }

    fn handle_transport_close(&self, state: &mut ConnectionState, status: u16, reason: &str) {
        if state.phase == Phase::Closed {
            return;
        }
        debug!(connection = %self.name, status, reason, "transport closed");
        state.phase = Phase::Closed;
        state.outbox.clear();
        state.incoming_requests.clear();
        state.incoming_responses.clear();
        self.cancel_pending(state);
        self.delegate.on_close(status, reason);
    }

    fn handle_transport_error(&self, state: &mut ConnectionState, code: i32, reason: &str) {
        if state.phase == Phase::Closed {
            return;
        }
        warn!(connection = %self.name, code, reason, "transport error");
        // The transport follows every error with on_close; teardown and
        // handler cancellation happen there.
        self.delegate.on_error(code, reason);
    }

    /// The peer violated the protocol: fail the connection with 1002.
    fn protocol_failure(&self, state: &mut ConnectionState, reason: String) {
        if state.phase == Phase::Closed {
            return;
        }
        error!(connection = %self.name, %reason, "protocol error; closing connection");
        self.delegate
            .on_error(close_code::PROTOCOL_ERROR as i32, &reason);
        state.phase = Phase::Closed;
        state.outbox.clear();
        state.incoming_requests.clear();
        state.incoming_responses.clear();
        self.cancel_pending(state);
        self.transport.close(close_code::PROTOCOL_ERROR, &reason);
        self.delegate.on_close(close_code::PROTOCOL_ERROR, &reason);
    }

    fn transport_failure(&self, state: &mut ConnectionState, reason: &str) {
        if state.phase == Phase::Closed {
            return;
        }
        error!(connection = %self.name, reason, "transport failure; closing connection");
        self.delegate.on_error(-1, reason);
        state.phase = Phase::Closed;
        state.outbox.clear();
        state.incoming_requests.clear();
        state.incoming_responses.clear();
        self.cancel_pending(state);
        self.transport.close(close_code::ABNORMAL, reason);
        self.delegate.on_close(close_code::ABNORMAL, reason);
    }

    fn cancel_pending(&self, state: &mut ConnectionState) {
        for (number, handler) in state.response_handlers.drain() {
            trace!(connection = %self.name, number, "cancelling pending response");
            handler(Err(BlipError::CancelledByClose));
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectionInner> {
        self.weak_self.clone()
    }
}

/// Bounces transport callbacks (which may arrive on any thread) onto the
/// connection's I/O actor before any protocol state is touched.
struct ConnectionObserver {
    inner: Weak<ConnectionInner>,
}

impl ConnectionObserver {
    fn dispatch<F>(&self, f: F)
    where
        F: FnOnce(&Arc<ConnectionInner>, &mut ConnectionState) + Send + 'static,
    {
        if let Some(inner) = self.inner.upgrade() {
            inner.dispatch(f);
        }
    }
}

impl TransportObserver for ConnectionObserver {
    fn on_open(&self) {
        self.dispatch(|inner, state| inner.handle_open(state));
    }

    fn on_message(&self, data: Vec<u8>) {
        self.dispatch(move |inner, state| inner.handle_inbound(state, data));
    }

    fn on_writeable(&self) {
        self.dispatch(|inner, state| inner.maybe_write(state));
    }

    fn on_close(&self, status: u16, reason: String) {
        self.dispatch(move |inner, state| inner.handle_transport_close(state, status, &reason));
    }

    fn on_error(&self, code: i32, reason: String) {
        self.dispatch(move |inner, state| inner.handle_transport_error(state, code, &reason));
    }
}

/// An inbound message mid-reassembly: the first frame's flags plus the
/// accumulated payload bytes.
struct PendingIn {
    number: u64,
    message_type: MessageType,
    flags: FrameFlags,
    buffer: Vec<u8>,
}

impl PendingIn {
    fn new(number: u64, message_type: MessageType, flags: FrameFlags) -> PendingIn {
        PendingIn {
            number,
            message_type,
            flags,
            buffer: Vec::new(),
        }
    }

    fn append(&mut self, payload: &[u8]) {
        self.buffer.extend_from_slice(payload);
    }

    fn into_message(self, connection: &ConnectionInner) -> Result<MessageIn, BlipError> {
        let (properties, used) = Properties::decode(&self.buffer)?;
        let body = self.buffer[used..].to_vec();
        Ok(MessageIn::new(
            self.number,
            self.message_type,
            self.flags,
            properties,
            body,
            connection.downgrade(),
        ))
    }
}

/// The outbound queue: in-flight messages with partial progress.
#[derive(Default)]
struct Outbox {
    queue: Vec<MessageOut>,
}

impl Outbox {
    fn push(&mut self, message: MessageOut) {
        self.queue.push(message);
    }

    /// Index of the message the fairness policy picks next.
    fn next_index(&self) -> Option<usize> {
        self.queue
            .iter()
            .enumerate()
            .min_by_key(|(_, message)| message.fairness_key())
            .map(|(index, _)| index)
    }

    fn get_mut(&mut self, index: usize) -> &mut MessageOut {
        &mut self.queue[index]
    }

    fn remove(&mut self, index: usize) -> MessageOut {
        self.queue.remove(index)
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn clear(&mut self) {
        self.queue.clear();
    }
}
