//! # Transport Abstraction
//!
//! The connection consumes a message-oriented duplex transport through the
//! [`Transport`] trait: a WebSocket-class object that accepts outbound byte
//! messages and delivers inbound ones through a [`TransportObserver`]. One
//! transport message carries exactly one frame.
//!
//! Callbacks may arrive on any thread; the connection bounces them onto its
//! own actor before touching protocol state. A transport that reports an
//! error through `on_error` must follow up with `on_close` so the
//! connection can reach its terminal state.
//!
//! Two in-process implementations live here: [`LoopbackTransport`] connects
//! two connections directly (optionally with simulated latency), and
//! [`MockTransport`] is a scriptable endpoint for protocol tests.

pub mod loopback;
pub mod mock;

pub use loopback::LoopbackTransport;
pub use mock::MockTransport;

use crate::error::BlipError;
use std::sync::Arc;

/// A reliable, ordered, message-oriented duplex byte transport.
pub trait Transport: Send + Sync + 'static {
    /// Install the observer. The transport signals `on_open` once it is
    /// ready to carry messages (possibly during this call).
    fn connect(&self, observer: Arc<dyn TransportObserver>);

    /// Transmit one transport message containing exactly one frame.
    fn send(&self, data: Vec<u8>) -> Result<(), BlipError>;

    /// Initiate an orderly shutdown. The observer receives `on_close` when
    /// the close completes.
    fn close(&self, status: u16, reason: &str);

    /// Whether the transport can accept more outbound data right now. When
    /// this returns `false` the writer suspends until `on_writeable`.
    fn is_writeable(&self) -> bool;
}

/// Callbacks a transport delivers upward. May be invoked on any thread.
pub trait TransportObserver: Send + Sync + 'static {
    fn on_open(&self);

    fn on_message(&self, data: Vec<u8>);

    /// The transport drained its outbound buffer and can accept more data.
    fn on_writeable(&self) {}

    fn on_close(&self, status: u16, reason: String);

    /// A transport-level error. Always followed by `on_close`.
    fn on_error(&self, _code: i32, _reason: String) {}
}
