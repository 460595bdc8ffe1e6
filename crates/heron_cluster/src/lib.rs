//! Cluster model and command fan-out.
//!
//! The cluster is a coordinator plus N content-bearing segments, each
//! identified by a content id (-1 for the coordinator). The fan-out
//! harness runs one shell command per targeted segment, locally or over
//! SSH, and aggregates exit statuses into a structured report. The
//! harness itself never decides fatality; callers inspect `num_errors`
//! and choose.

mod cluster;
mod fanout;

pub use cluster::{Cluster, ClusterError, Scope, SegmentConfig};
pub use fanout::{
    check_cluster_error, execute_cluster_command, CommandResult, RemoteOutput,
};
