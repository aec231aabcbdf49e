//! Error types for the mirror engine.

use crate::remote::RemoteError;
use firemirror_protocol::ProtocolError;
use firemirror_storage::StorageError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while mirroring.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The remote side refused a forwarded write.
    ///
    /// The local commit stands; only the forward failed.
    #[error("remote write for {key} failed: {message}")]
    RemoteWrite {
        /// Key of the originating write.
        key: String,
        /// Error message.
        message: String,
    },

    /// Loading or saving the local replica failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] StorageError),

    /// The change stream sent something unusable, or was terminated.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The change stream could not be re-established within the retry bound.
    #[error("change stream unavailable after {attempts} attempts")]
    ReconnectExhausted {
        /// Consecutive failed attempts.
        attempts: u32,
    },

    /// The engine has been disposed.
    #[error("engine disposed")]
    Disposed,

    /// The engine has not been started.
    #[error("engine not started")]
    NotStarted,

    /// Invalid state transition.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// A key that cannot be stored remotely.
    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    /// A caller value could not be converted to or from JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Wraps a failed forward of the write to `key`.
    pub fn remote_write(key: impl Into<String>, error: &RemoteError) -> Self {
        Self::RemoteWrite {
            key: key.into(),
            message: error.to_string(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Transport {
                retryable: true,
                ..
            }
        )
    }

    /// Returns true if this error ends the change stream for good.
    pub fn is_terminal_for_stream(&self) -> bool {
        matches!(
            self,
            EngineError::Protocol(_) | EngineError::ReconnectExhausted { .. } | EngineError::Disposed
        )
    }
}

impl From<RemoteError> for EngineError {
    fn from(error: RemoteError) -> Self {
        Self::Transport {
            retryable: error.is_retryable(),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(EngineError::transport_retryable("connection lost").is_retryable());
        assert!(!EngineError::transport_fatal("bad certificate").is_retryable());
        assert!(!EngineError::Disposed.is_retryable());
        assert!(EngineError::from(RemoteError::transport("reset")).is_retryable());
        assert!(!EngineError::from(RemoteError::rejected("permission denied")).is_retryable());
    }

    #[test]
    fn terminal_stream_errors() {
        assert!(EngineError::Protocol(ProtocolError::AuthRevoked).is_terminal_for_stream());
        assert!(EngineError::ReconnectExhausted { attempts: 3 }.is_terminal_for_stream());
        assert!(!EngineError::transport_retryable("blip").is_terminal_for_stream());
    }

    #[test]
    fn error_display() {
        let err = EngineError::remote_write("dino1", &RemoteError::rejected("permission denied"));
        assert!(err.to_string().contains("dino1"));
        assert!(err.to_string().contains("permission denied"));

        let err = EngineError::ReconnectExhausted { attempts: 8 };
        assert_eq!(err.to_string(), "change stream unavailable after 8 attempts");
    }
}
