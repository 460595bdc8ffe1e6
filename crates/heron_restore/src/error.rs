//! Restore-layer errors.

use thiserror::Error;

use heron_cluster::ClusterError;
use heron_history::HistoryError;

pub type RestoreResult<T> = Result<T, RestoreError>;

/// Top-level error for the restore control plane. Lower layers convert
/// in via `From`.
#[derive(Error, Debug)]
pub enum RestoreError {
    /// A SQL statement failed on one connection. Fatal unless the run is
    /// under on-error-continue.
    #[error("SQL error: {0}")]
    Sql(String),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("History error: {0}")]
    History(#[from] HistoryError),

    #[error(transparent)]
    Toc(#[from] heron_common::toc::TocError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("helper agent failure on segment(s) [{contents}]: error sentinel present")]
    AgentFailure { contents: String },

    #[error("restore terminated by signal")]
    Terminated,
}
