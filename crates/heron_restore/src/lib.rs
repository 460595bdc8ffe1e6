//! The restore executor.
//!
//! Replays recorded DDL across a fixed pool of database connections,
//! batching statements to avoid known deadlocks (post-data) and to honor
//! dependency tiers (pre-data), with an on-error-continue policy that
//! tolerates per-object failures while keeping fatal errors fatal. The
//! `agents` module is the driver-side counterpart of the per-segment
//! helper: it launches agents across the cluster, pre-creates the pipes
//! they expect, and checks their error sentinels afterwards.

pub mod agents;
mod error;
mod parallel;
mod pool;
mod progress;

pub use error::{RestoreError, RestoreResult};
pub use parallel::{
    batch_postdata_statements, batch_predata_statements, execute_postdata,
    execute_predata, execute_statements, ExecutionReport,
};
pub use pool::{ConnectionPool, SegmentConnection};
pub use progress::{BarProgress, NoopProgress, ProgressReporter};
