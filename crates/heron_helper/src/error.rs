//! Helper-agent errors.
//!
//! Anything that reaches the top of the helper is fatal for the run: the
//! `_error` sentinel is written so the driver can tell an unclean exit
//! from a clean one even when the last table copy appeared to succeed.
//! The one non-fatal case, a pipe write failing because the database
//! aborted its side of a copy under on-error-continue, is handled inside
//! the restore loop and never surfaces here.

use std::path::PathBuf;

use thiserror::Error;

use heron_common::toc::TocError;

pub type HelperResult<T> = Result<T, HelperError>;

#[derive(Error, Debug)]
pub enum HelperError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toc(#[from] TocError),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("malformed plugin config: {0}")]
    PluginConfig(#[from] serde_yaml::Error),

    #[error("plugin `{command}` exited with {status}")]
    PluginFailed { command: String, status: String },

    #[error("invalid oid `{token}` in oid list {path}")]
    InvalidOid { token: String, path: PathBuf },

    #[error("oid list {0} is empty")]
    EmptyOidList(PathBuf),

    #[error("error reading data stream: {0}")]
    StreamRead(std::io::Error),

    #[error("error writing to pipe for oid {oid}: {source}")]
    PipeWrite {
        oid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("received a termination signal")]
    Terminated,
}

impl HelperError {
    /// Termination is reported through the same channel as errors but
    /// exits 2 without counting as a helper failure.
    pub fn is_termination(&self) -> bool {
        matches!(self, HelperError::Terminated)
    }
}
