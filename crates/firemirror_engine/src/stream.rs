//! Reconnecting change-stream reader.

use crate::cancel::CancelToken;
use crate::config::RetryConfig;
use crate::error::{EngineError, EngineResult};
use crate::remote::Remote;
use firemirror_protocol::{ChangeEvent, ChangeKind, FrameDecoder};
use std::io::{self, BufRead, BufReader, Read};
use std::sync::Arc;

/// One step of the change stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// A stream was opened. `reconnect` is false for the first one.
    ///
    /// There is no resume cursor, so the server starts every stream with a
    /// full snapshot of the namespace.
    Connected {
        /// Whether an earlier stream was lost.
        reconnect: bool,
    },
    /// A put or patch from the server.
    Change(ChangeEvent),
    /// The transport failed; a reconnect follows on the next poll.
    Disconnected {
        /// What went wrong.
        error: String,
    },
}

/// Lazy, unbounded sequence of [`StreamItem`]s for one namespace.
///
/// Blocks in `next()` while waiting for data. Keep-alives are swallowed;
/// cancel, revoked auth and undecodable frames end the sequence with an
/// error. Transport failures are retried with the configured backoff until
/// `max_attempts` consecutive failures, after which
/// [`EngineError::ReconnectExhausted`] ends the sequence.
///
/// Closing the [`CancelToken`] aborts a blocked read and ends the sequence
/// with `None`. Dropping the decoder closes the transport.
pub struct StreamDecoder<R: Remote> {
    remote: Arc<R>,
    path: String,
    retry: RetryConfig,
    cancel: CancelToken,
    reader: Option<BufReader<Box<dyn Read + Send>>>,
    shutdown: Option<Arc<dyn Fn() + Send + Sync>>,
    frames: FrameDecoder,
    failures: u32,
    connected_once: bool,
    finished: bool,
}

impl<R: Remote> StreamDecoder<R> {
    /// Creates a decoder. Nothing is opened until the first `next()`.
    pub fn new(remote: Arc<R>, path: impl Into<String>, retry: RetryConfig, cancel: CancelToken) -> Self {
        Self {
            remote,
            path: path.into(),
            retry,
            cancel,
            reader: None,
            shutdown: None,
            frames: FrameDecoder::new(),
            failures: 0,
            connected_once: false,
            finished: false,
        }
    }

    /// Consecutive transport failures since the last delivered change.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    fn finish(&mut self) {
        self.finished = true;
        self.close_transport();
    }

    fn close_transport(&mut self) {
        self.reader = None;
        self.frames.reset();
        if let Some(shutdown) = self.shutdown.take() {
            shutdown();
        }
    }

    fn disconnect(&mut self, error: String) -> StreamItem {
        self.close_transport();
        self.failures += 1;
        tracing::warn!(path = %self.path, failures = self.failures, error = %error, "change stream lost");
        StreamItem::Disconnected { error }
    }

    /// Opens a stream after the backoff for the current failure count.
    ///
    /// `Ok(None)` means the attempt failed in a retryable way or was
    /// cancelled; the caller loops.
    fn connect(&mut self) -> EngineResult<Option<StreamItem>> {
        if self.failures >= self.retry.max_attempts.max(1) {
            return Err(EngineError::ReconnectExhausted {
                attempts: self.failures,
            });
        }

        let delay = self.retry.delay_for_attempt(self.failures);
        if !delay.is_zero() {
            tracing::debug!(path = %self.path, ?delay, "waiting before reconnect");
            if self.cancel.wait(delay) {
                return Ok(None);
            }
        }
        if self.cancel.is_closed() {
            return Ok(None);
        }

        match self.remote.open_change_stream(&self.path) {
            Ok(stream) => {
                let (reader, shutdown) = stream.into_parts();
                self.cancel.set_shutdown(Some(Arc::clone(&shutdown)));
                self.shutdown = Some(shutdown);
                self.reader = Some(BufReader::new(reader));
                self.frames.reset();

                let reconnect = self.connected_once;
                self.connected_once = true;
                tracing::debug!(path = %self.path, reconnect, "change stream opened");
                Ok(Some(StreamItem::Connected { reconnect }))
            }
            Err(e) if e.is_retryable() => {
                self.failures += 1;
                tracing::warn!(path = %self.path, failures = self.failures, error = %e, "failed to open change stream");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read_item(&mut self) -> Option<EngineResult<StreamItem>> {
        let reader = self.reader.as_mut()?;
        let mut line = String::new();
        let read = reader.read_line(&mut line);

        if self.cancel.is_closed() {
            self.finish();
            return None;
        }

        match read {
            Ok(0) => Some(Ok(self.disconnect("stream closed by server".to_string()))),
            Ok(_) => {
                let frame = self.frames.push_line(&line)?;
                match ChangeEvent::from_frame(frame) {
                    Ok(event) if event.kind == ChangeKind::KeepAlive => None,
                    Ok(event) => {
                        if let Some(err) = event.terminal_error() {
                            tracing::warn!(path = %self.path, error = %err, "change stream terminated by server");
                            self.finish();
                            return Some(Err(err.into()));
                        }
                        self.failures = 0;
                        Some(Ok(StreamItem::Change(event)))
                    }
                    Err(err) => {
                        tracing::error!(path = %self.path, error = %err, "undecodable change frame");
                        self.finish();
                        Some(Err(err.into()))
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => None,
            Err(e) => Some(Ok(self.disconnect(e.to_string()))),
        }
    }
}

impl<R: Remote> Iterator for StreamDecoder<R> {
    type Item = EngineResult<StreamItem>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.cancel.is_closed() {
                self.finish();
                return None;
            }

            if self.reader.is_none() {
                match self.connect() {
                    Ok(Some(item)) => return Some(Ok(item)),
                    Ok(None) => continue,
                    Err(e) => {
                        self.finish();
                        return Some(Err(e));
                    }
                }
            }

            if let Some(item) = self.read_item() {
                return Some(item);
            }
        }
    }
}

impl<R: Remote> Drop for StreamDecoder<R> {
    fn drop(&mut self) {
        self.close_transport();
    }
}
