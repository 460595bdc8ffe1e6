//! Fixed-size connection pool.
//!
//! The pool owns its connections; workers address them by index and
//! never alias raw connection handles across threads. The pool size is
//! chosen once per run and does not change.

use parking_lot::Mutex;
use tracing::warn;

use crate::error::RestoreResult;

/// One database session. Implementations wrap whatever driver the
/// deployment uses; tests use an in-memory recorder.
pub trait SegmentConnection: Send {
    /// Execute one SQL statement to completion. Blocking.
    fn execute(&mut self, statement: &str) -> RestoreResult<()>;
}

/// A fixed vector of connections numbered `0..num_conns`.
pub struct ConnectionPool<C: SegmentConnection> {
    conns: Vec<Mutex<C>>,
}

impl<C: SegmentConnection> ConnectionPool<C> {
    pub fn new(conns: Vec<C>) -> Self {
        Self {
            conns: conns.into_iter().map(Mutex::new).collect(),
        }
    }

    pub fn num_conns(&self) -> usize {
        self.conns.len()
    }

    /// Resolve an optional connection index, falling back to connection 0
    /// when absent or out of range.
    pub fn validate_conn_num(&self, which: Option<usize>) -> usize {
        match which {
            Some(n) if n < self.conns.len() => n,
            Some(n) => {
                warn!(
                    requested = n,
                    pool_size = self.conns.len(),
                    "connection number out of range, using default connection"
                );
                0
            }
            None => 0,
        }
    }

    /// Execute a statement on the numbered connection.
    pub fn execute(&self, statement: &str, which: usize) -> RestoreResult<()> {
        self.conns[which].lock().execute(statement)
    }
}
