//! # blip-mux
//!
//! A bidirectional, multiplexed request/response messaging engine layered
//! over a reliable, ordered, message-oriented duplex transport (a
//! WebSocket-class connection). Two symmetric peers concurrently issue
//! requests, stream large payloads in interleaved frames under a fairness
//! and priority policy, and receive responses out of order relative to the
//! order they were requested.
//!
//! The crate has three layers:
//!
//! - [`actor`]: a many-actor, single-threaded-per-actor runtime (scheduler,
//!   mailboxes, timers) that makes the protocol engine's concurrency
//!   tractable.
//! - [`protocol`]: framing, property encoding, message objects, and the
//!   [`Connection`](protocol::Connection) actor that multiplexes messages
//!   over one transport.
//! - [`transport`]: the contract the engine expects from a transport, plus
//!   in-process loopback and mock implementations for tests and the
//!   `blip-echo` harness.

pub mod actor;
pub mod address;
pub mod cli;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod transport;

pub use actor::{Actor, Channel, Mailbox, Scheduler, Timer};
pub use address::Address;
pub use error::BlipError;
pub use protocol::{
    Connection, ConnectionDelegate, ConnectionOptions, MessageBuilder, MessageIn, MessageType,
    Properties,
};
pub use transport::{Transport, TransportObserver};

/// The current version of the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values for the echo harness.
pub mod defaults {
    /// Default number of echoer actors.
    pub const ECHOERS: usize = 100;

    /// Default request body size in bytes.
    pub const MESSAGE_SIZE: usize = 300 * 1024;
}
