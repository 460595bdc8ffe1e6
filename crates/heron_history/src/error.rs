//! History-layer errors.

use thiserror::Error;

use crate::section::SectionError;

/// Convenience alias for `Result<T, HistoryError>`.
pub type HistoryResult<T> = Result<T, HistoryError>;

/// Errors from the history store and the backup-config document.
///
/// Store errors from the embedded database are surfaced verbatim: a
/// duplicate timestamp insert displays exactly as
/// `UNIQUE constraint failed: backups.timestamp`.
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("timestamp doesn't match any existing backups")]
    TimestampNotFound,

    #[error("{0}")]
    Store(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed backup config document: {0}")]
    Document(#[from] serde_yaml::Error),

    #[error(transparent)]
    Section(#[from] SectionError),
}
