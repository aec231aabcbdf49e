//! Remote collaborator abstraction.
//!
//! The engine never builds requests itself. Everything it needs from the
//! remote database goes through [`Remote`], so the HTTP client, auth and
//! query handling live outside this crate.

use serde_json::Value;
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use thiserror::Error;

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Failure reported by a [`Remote`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The request did not reach the server or got no answer.
    #[error("transport failure: {message}")]
    Transport {
        /// Error message.
        message: String,
    },

    /// The server answered and refused the request.
    #[error("rejected: {message}")]
    Rejected {
        /// Error message.
        message: String,
    },
}

impl RemoteError {
    /// Creates a transport failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a rejection.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Returns true if repeating the request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transport { .. })
    }
}

type Shutdown = Arc<dyn Fn() + Send + Sync>;

/// A server-push byte stream.
///
/// The shutdown hook must make a blocked `read` return promptly, for
/// example by shutting down the socket. It is called when the stream
/// decoder is cancelled or dropped, and may be called more than once.
pub struct ByteStream {
    reader: Box<dyn Read + Send>,
    shutdown: Shutdown,
}

impl ByteStream {
    /// Wraps `reader` together with the hook that aborts its in-flight reads.
    pub fn new(
        reader: impl Read + Send + 'static,
        shutdown: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Splits the stream into its reader and shutdown hook.
    pub fn into_parts(self) -> (Box<dyn Read + Send>, Arc<dyn Fn() + Send + Sync>) {
        (self.reader, self.shutdown)
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream").finish_non_exhaustive()
    }
}

/// The remote database as seen by the engine.
///
/// `path` is always the mirrored namespace; `key` names one entry below it.
pub trait Remote: Send + Sync {
    /// Fetches the whole document at `path`. `None` means nothing is stored.
    fn fetch_snapshot(&self, path: &str) -> RemoteResult<Option<Value>>;

    /// Opens the server-push change stream for `path`.
    fn open_change_stream(&self, path: &str) -> RemoteResult<ByteStream>;

    /// Appends `value` under a server-generated key and returns that key.
    ///
    /// The engine never calls this: `post` generates its key locally and
    /// forwards with [`write`](Self::write). It is kept for callers that
    /// want the server to pick the key.
    fn push(&self, path: &str, value: &Value) -> RemoteResult<String>;

    /// Replaces the entry at `key`.
    fn write(&self, path: &str, key: &str, value: &Value) -> RemoteResult<()>;

    /// Merges the fields of `partial` into the entry at `key`.
    fn merge(&self, path: &str, key: &str, partial: &Value) -> RemoteResult<()>;

    /// Removes the entry at `key`.
    fn remove(&self, path: &str, key: &str) -> RemoteResult<()>;
}

impl<R: Remote + ?Sized> Remote for Arc<R> {
    fn fetch_snapshot(&self, path: &str) -> RemoteResult<Option<Value>> {
        (**self).fetch_snapshot(path)
    }

    fn open_change_stream(&self, path: &str) -> RemoteResult<ByteStream> {
        (**self).open_change_stream(path)
    }

    fn push(&self, path: &str, value: &Value) -> RemoteResult<String> {
        (**self).push(path, value)
    }

    fn write(&self, path: &str, key: &str, value: &Value) -> RemoteResult<()> {
        (**self).write(path, key, value)
    }

    fn merge(&self, path: &str, key: &str, partial: &Value) -> RemoteResult<()> {
        (**self).merge(path, key, partial)
    }

    fn remove(&self, path: &str, key: &str) -> RemoteResult<()> {
        (**self).remove(path, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn error_classification() {
        assert!(RemoteError::transport("timeout").is_retryable());
        assert!(!RemoteError::rejected("permission denied").is_retryable());
        assert_eq!(
            RemoteError::rejected("permission denied").to_string(),
            "rejected: permission denied"
        );
    }

    #[test]
    fn byte_stream_parts() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let stream = ByteStream::new(Cursor::new(b"data".to_vec()), move || {
            flag.store(true, Ordering::SeqCst)
        });
        assert!(format!("{stream:?}").contains("ByteStream"));

        let (mut reader, shutdown) = stream.into_parts();
        let mut buf = String::new();
        reader.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "data");
        assert!(!fired.load(Ordering::SeqCst));

        shutdown();
        assert!(fired.load(Ordering::SeqCst));
    }
}
