//! Error types for protocol decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding the server-push stream.
///
/// Every variant is terminal for the stream subscription that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A frame could not be interpreted.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The frame named an event this client does not understand.
    #[error("unknown event type: {0}")]
    UnknownEvent(String),

    /// The `data` field of a put/patch frame was not valid JSON.
    #[error("invalid event data: {0}")]
    InvalidData(String),

    /// The server cancelled the subscription.
    #[error("stream cancelled by server: {0}")]
    Cancelled(String),

    /// The credential backing the subscription was revoked.
    #[error("authentication revoked")]
    AuthRevoked,

    /// A change referenced an unusable path.
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl ProtocolError {
    /// Creates a malformed-frame error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedFrame(message.into())
    }

    /// Returns true if the server asked us to stop (cancel or revoked auth).
    pub fn is_server_termination(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::AuthRevoked)
    }
}
