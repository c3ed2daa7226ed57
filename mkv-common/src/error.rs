//! # Error Taxonomy
//!
//! One error enum shared by resolvers, the connection driver and the command
//! facade. Every failure surfaced to callers maps onto exactly one variant, so
//! each invocation style can propagate it through its native channel
//! (returned `Err`, failed future, error signal on a stream).

use thiserror::Error;

/// Result type used across ModalKV crates.
pub type MkvResult<T> = Result<T, MkvError>;

/// Errors surfaced by the facade and its collaborators.
#[derive(Debug, Error)]
pub enum MkvError {
    /// The resolver could not produce a usable address.
    #[error("target unavailable: {0}")]
    UnavailableTarget(String),

    /// Transport or handshake failure while establishing a connection.
    #[error("failed to connect to {addr}: {reason}")]
    Connection { addr: String, reason: String },

    /// A command was issued against a closed connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Caller-supplied argument rejected before any network interaction.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Subscribe/unsubscribe was not acknowledged by the store.
    #[error("subscription error: {0}")]
    Subscription(String),

    /// The store replied with an error (e.g. WRONGTYPE).
    #[error("command error: {0}")]
    Command(String),

    /// RESP2 framing violation.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// Reply type did not match what the command expects.
    #[error("unexpected response to {command}")]
    UnexpectedResponse { command: &'static str },

    /// Network or IO failure after the connection was established.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MkvError {
    /// Builds an `InvalidArgument` error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        MkvError::InvalidArgument(message.into())
    }

    /// Duplicates an error for fan-out to several waiters.
    ///
    /// `std::io::Error` is not `Clone`, so IO errors are rebuilt from their
    /// kind and message.
    pub fn duplicate(&self) -> Self {
        match self {
            MkvError::UnavailableTarget(msg) => MkvError::UnavailableTarget(msg.clone()),
            MkvError::Connection { addr, reason } => MkvError::Connection {
                addr: addr.clone(),
                reason: reason.clone(),
            },
            MkvError::ConnectionClosed => MkvError::ConnectionClosed,
            MkvError::InvalidArgument(msg) => MkvError::InvalidArgument(msg.clone()),
            MkvError::Subscription(msg) => MkvError::Subscription(msg.clone()),
            MkvError::Command(msg) => MkvError::Command(msg.clone()),
            MkvError::Protocol(msg) => MkvError::Protocol(msg),
            MkvError::UnexpectedResponse { command } => MkvError::UnexpectedResponse { command },
            MkvError::Io(err) => MkvError::Io(std::io::Error::new(err.kind(), err.to_string())),
        }
    }

    /// Returns true for errors raised by local argument validation.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, MkvError::InvalidArgument(_))
    }

    /// Returns true when the connection was closed before the command ran.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, MkvError::ConnectionClosed)
    }
}
