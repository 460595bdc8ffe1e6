//! Cooperative termination signal shared between a signal handler and the
//! long-running loops it has to stop.
//!
//! The helper agent's data loop and the restore executor's workers both
//! check the flag between work items; the non-blocking FIFO open retry
//! loop additionally parks on `wait_timeout` so a SIGTERM wakes it within
//! milliseconds instead of after the full poll interval.
//!
//! The signal handler is the only writer outside of tests; everything else
//! only reads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A clonable termination flag with condvar-backed waiting.
///
/// Calling `terminate()` wakes every thread blocked in `wait_timeout()`
/// immediately.
#[derive(Clone)]
pub struct TerminationSignal {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl TerminationSignal {
    /// Create a signal in the not-terminated state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                flag: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Request termination and wake all waiters.
    pub fn terminate(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    /// Has termination been requested?
    pub fn was_terminated(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Park for at most `duration`, waking early on `terminate()`.
    /// Returns `true` when termination was requested.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        if self.was_terminated() {
            return true;
        }
        let mut guard = self.inner.mutex.lock();
        let _ = self.inner.condvar.wait_for(&mut guard, duration);
        self.was_terminated()
    }
}

impl Default for TerminationSignal {
    fn default() -> Self {
        Self::new()
    }
}
