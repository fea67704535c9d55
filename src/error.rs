//! Error types shared across the protocol engine.

use thiserror::Error;

/// Errors produced by the protocol engine.
///
/// `Transport`, `Protocol`, `Application` and `CancelledByClose` mirror the
/// failure classes a peer or the connection can surface; the remaining
/// variants report local misuse (responding twice, responding to a message
/// that takes no reply, sending on a closed connection).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlipError {
    /// The underlying transport failed or rejected an operation.
    #[error("transport error {code}: {reason}")]
    Transport { code: i32, reason: String },

    /// The peer violated the wire protocol. Fatal for the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An Error message received in reply to one of our requests.
    #[error("{domain} error {code}: {message}")]
    Application {
        domain: String,
        code: i64,
        message: String,
    },

    /// The connection closed before a response to a pending request arrived.
    #[error("connection closed before the response arrived")]
    CancelledByClose,

    /// The connection is no longer usable.
    #[error("connection is closed")]
    ConnectionClosed,

    /// `respond` was called more than once on the same request.
    #[error("message has already been responded to")]
    AlreadyResponded,

    /// The message does not accept a response (it is not a request, or it
    /// was sent with the noReply flag).
    #[error("message does not accept a response")]
    NoResponsePossible,

    /// A property name or value contains bytes reserved by the encoding.
    #[error("invalid property string: {0}")]
    InvalidProperty(String),

    /// A string could not be parsed as an address URL.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}
