//! Backup history: the section bitmask model, the per-backup
//! configuration record, and the embedded store that remembers every
//! completed backup.

mod config;
mod section;
mod store;

pub mod error;

pub use config::{BackupConfig, RestorePlanEntry};
pub use error::HistoryError;
pub use section::{BackupFlags, RestoreFlags, SectionError, Sections};
pub use store::HistoryStore;

/// Backup timestamps are minted by the shared clock helper.
pub use heron_common::timestamp::current_timestamp;
