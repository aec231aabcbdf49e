//! Forwarding of committed local writes to the remote.
//!
//! A single worker thread drains a queue in commit order, so the remote sees
//! writes in the same order as local subscribers.

use crate::cancel::CancelToken;
use crate::config::RetryConfig;
use crate::error::{EngineError, EngineResult};
use crate::remote::{Remote, RemoteResult};
use crate::state::MirrorStats;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A remote call derived from a local write.
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardOp {
    /// Replace the entry.
    Write {
        /// Entry key.
        key: String,
        /// New value.
        value: Value,
    },
    /// Merge fields into the entry.
    Merge {
        /// Entry key.
        key: String,
        /// Fields to merge.
        partial: Value,
    },
    /// Remove the entry.
    Remove {
        /// Entry key.
        key: String,
    },
}

impl ForwardOp {
    /// Key of the entry the operation targets.
    pub fn key(&self) -> &str {
        match self {
            ForwardOp::Write { key, .. }
            | ForwardOp::Merge { key, .. }
            | ForwardOp::Remove { key } => key,
        }
    }

    fn send<R: Remote + ?Sized>(&self, remote: &R, path: &str) -> RemoteResult<()> {
        match self {
            ForwardOp::Write { key, value } => remote.write(path, key, value),
            ForwardOp::Merge { key, partial } => remote.merge(path, key, partial),
            ForwardOp::Remove { key } => remote.remove(path, key),
        }
    }
}

struct Job {
    op: ForwardOp,
    reply: Sender<EngineResult<()>>,
}

/// Receipt for an accepted local write.
///
/// The write is already committed and visible locally when the handle is
/// returned. The handle reports whether the remote accepted it as well.
/// The outcome can be taken once.
#[derive(Debug)]
pub struct WriteHandle {
    key: String,
    rx: Receiver<EngineResult<()>>,
    taken: AtomicBool,
}

impl WriteHandle {
    fn new(key: String, rx: Receiver<EngineResult<()>>) -> Self {
        Self {
            key,
            rx,
            taken: AtomicBool::new(false),
        }
    }

    /// Key of the written entry. For `post`, the generated push id.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Blocks until the remote outcome is known.
    pub fn wait(self) -> EngineResult<()> {
        if self.taken.load(Ordering::SeqCst) {
            return Err(EngineError::Disposed);
        }
        self.rx.recv().unwrap_or(Err(EngineError::Disposed))
    }

    /// Waits up to `timeout`. `None` if still pending or already taken.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<EngineResult<()>> {
        if self.taken.load(Ordering::SeqCst) {
            return None;
        }
        let outcome = match self.rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => return None,
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::Disposed),
        };
        self.taken.store(true, Ordering::SeqCst);
        Some(outcome)
    }

    /// Returns the outcome if it is already known.
    pub fn try_outcome(&self) -> Option<EngineResult<()>> {
        if self.taken.load(Ordering::SeqCst) {
            return None;
        }
        let outcome = match self.rx.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => Err(EngineError::Disposed),
        };
        self.taken.store(true, Ordering::SeqCst);
        Some(outcome)
    }
}

/// Worker that sends committed writes to the remote with bounded retry.
pub(crate) struct Forwarder {
    queue: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancel: CancelToken,
}

impl Forwarder {
    /// Spawns the worker thread.
    pub(crate) fn spawn<R: Remote + 'static>(
        remote: Arc<R>,
        path: String,
        retry: RetryConfig,
        stats: Arc<RwLock<MirrorStats>>,
    ) -> EngineResult<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();

        let worker = thread::Builder::new()
            .name("firemirror-forward".to_string())
            .spawn(move || {
                for job in rx {
                    let outcome = if worker_cancel.is_closed() {
                        Err(EngineError::Disposed)
                    } else {
                        forward_with_retry(&*remote, &path, &job.op, &retry, &worker_cancel, &stats)
                    };
                    let _ = job.reply.send(outcome);
                }
            })
            .map_err(|e| EngineError::transport_fatal(format!("failed to spawn forwarder: {e}")))?;

        Ok(Self {
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            cancel,
        })
    }

    /// Queues `op` and returns its handle.
    pub(crate) fn enqueue(&self, op: ForwardOp) -> WriteHandle {
        let (reply, rx) = mpsc::channel();
        let key = op.key().to_string();
        let job = Job { op, reply };

        if let Some(queue) = self.queue.lock().as_ref() {
            if let Err(mpsc::SendError(job)) = queue.send(job) {
                let _ = job.reply.send(Err(EngineError::Disposed));
            }
        } else {
            let _ = job.reply.send(Err(EngineError::Disposed));
        }
        WriteHandle::new(key, rx)
    }

    /// Stops the worker. Jobs still queued complete with `Disposed`.
    pub(crate) fn shutdown(&self) {
        self.cancel.close();
        drop(self.queue.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("forward worker panicked");
            }
        }
    }
}

fn forward_with_retry<R: Remote + ?Sized>(
    remote: &R,
    path: &str,
    op: &ForwardOp,
    retry: &RetryConfig,
    cancel: &CancelToken,
    stats: &RwLock<MirrorStats>,
) -> EngineResult<()> {
    let mut attempt = 0u32;
    loop {
        match op.send(remote, path) {
            Ok(()) => {
                stats.write().forwarded += 1;
                tracing::trace!(key = %op.key(), attempt, "write forwarded");
                return Ok(());
            }
            Err(e) => {
                attempt += 1;
                if !e.is_retryable() || attempt >= retry.max_attempts {
                    tracing::warn!(key = %op.key(), attempts = attempt, error = %e, "failed to forward write");
                    let err = EngineError::remote_write(op.key(), &e);
                    let mut stats = stats.write();
                    stats.forward_failures += 1;
                    stats.last_error = Some(err.to_string());
                    return Err(err);
                }
                tracing::debug!(key = %op.key(), attempt, error = %e, "retrying forward");
                if cancel.wait(retry.delay_for_attempt(attempt)) {
                    return Err(EngineError::Disposed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRemote, RecordedWrite};
    use serde_json::json;

    fn forwarder(remote: &Arc<MemoryRemote>, attempts: u32) -> (Forwarder, Arc<RwLock<MirrorStats>>) {
        let stats = Arc::new(RwLock::new(MirrorStats::default()));
        let retry = RetryConfig::new(attempts)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false);
        let forwarder =
            Forwarder::spawn(Arc::clone(remote), "dinos".into(), retry, Arc::clone(&stats)).unwrap();
        (forwarder, stats)
    }

    #[test]
    fn forwards_in_order() {
        let remote = Arc::new(MemoryRemote::new());
        let (forwarder, stats) = forwarder(&remote, 3);

        let first = forwarder.enqueue(ForwardOp::Write {
            key: "a".into(),
            value: json!(1),
        });
        let second = forwarder.enqueue(ForwardOp::Remove { key: "a".into() });
        assert_eq!(first.key(), "a");
        first.wait().unwrap();
        second.wait().unwrap();

        assert_eq!(
            remote.writes(),
            vec![
                RecordedWrite::Write {
                    path: "dinos".into(),
                    key: "a".into(),
                    value: json!(1)
                },
                RecordedWrite::Remove {
                    path: "dinos".into(),
                    key: "a".into()
                },
            ]
        );
        assert_eq!(stats.read().forwarded, 2);
    }

    #[test]
    fn retries_transient_failures() {
        let remote = Arc::new(MemoryRemote::new());
        remote.fail_next_writes(2);
        let (forwarder, stats) = forwarder(&remote, 3);

        let handle = forwarder.enqueue(ForwardOp::Merge {
            key: "a".into(),
            partial: json!({"h": 1}),
        });
        handle.wait().unwrap();
        assert_eq!(remote.writes().len(), 1);
        assert_eq!(stats.read().forward_failures, 0);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let remote = Arc::new(MemoryRemote::new());
        remote.fail_next_writes(5);
        let (forwarder, stats) = forwarder(&remote, 2);

        let handle = forwarder.enqueue(ForwardOp::Remove { key: "a".into() });
        assert!(matches!(handle.wait(), Err(EngineError::RemoteWrite { key, .. }) if key == "a"));
        assert_eq!(stats.read().forward_failures, 1);
        assert!(stats.read().last_error.is_some());
    }

    #[test]
    fn rejection_is_not_retried() {
        let remote = Arc::new(MemoryRemote::new());
        remote.reject_writes(Some("permission denied"));
        let (forwarder, _) = forwarder(&remote, 5);

        let handle = forwarder.enqueue(ForwardOp::Remove { key: "a".into() });
        let outcome = handle.wait_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, Err(EngineError::RemoteWrite { .. })));
        assert!(handle.try_outcome().is_none());
    }

    #[test]
    fn enqueue_after_shutdown_reports_disposed() {
        let remote = Arc::new(MemoryRemote::new());
        let (forwarder, _) = forwarder(&remote, 3);
        forwarder.shutdown();

        let handle = forwarder.enqueue(ForwardOp::Remove { key: "a".into() });
        assert!(matches!(handle.try_outcome(), Some(Err(EngineError::Disposed))));
        assert!(remote.writes().is_empty());
    }
}
