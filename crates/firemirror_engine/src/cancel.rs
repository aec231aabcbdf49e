//! Cooperative cancellation shared between the engine and its threads.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Inner {
    closed: bool,
    hook: Option<Hook>,
}

/// A clonable cancellation flag with interruptible waits.
///
/// Closing the token wakes every sleeper and runs the registered shutdown
/// hook, which is how a blocked network read gets unblocked.
#[derive(Clone, Default)]
pub struct CancelToken {
    shared: Arc<(Mutex<Inner>, Condvar)>,
}

impl CancelToken {
    /// Creates an open token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes the token. Idempotent.
    pub fn close(&self) {
        let (lock, cvar) = &*self.shared;
        let hook = {
            let mut inner = lock.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.hook.take()
        };
        cvar.notify_all();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.0.lock().closed
    }

    /// Sleeps for up to `timeout`. Returns true if the token was closed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.shared;
        let deadline = Instant::now() + timeout;
        let mut inner = lock.lock();
        while !inner.closed {
            if cvar.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        inner.closed
    }

    /// Registers the hook run on close, replacing any previous one.
    ///
    /// If the token is already closed the hook runs immediately.
    pub fn set_shutdown(&self, hook: Option<Hook>) {
        let run_now = {
            let mut inner = self.shared.0.lock();
            if inner.closed {
                hook
            } else {
                inner.hook = hook;
                None
            }
        };
        if let Some(hook) = run_now {
            hook();
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    #[test]
    fn wait_times_out_when_open() {
        let token = CancelToken::new();
        assert!(!token.wait(Duration::from_millis(10)));
        assert!(!token.is_closed());
    }

    #[test]
    fn close_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            thread::spawn(move || token.wait(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        token.close();
        assert!(waiter.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn hook_runs_once() {
        let token = CancelToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        token.set_shutdown(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        token.close();
        token.close();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_registered_after_close_runs_immediately() {
        let token = CancelToken::new();
        token.close();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        token.set_shutdown(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
