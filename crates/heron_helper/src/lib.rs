//! The per-segment helper agent.
//!
//! One helper process runs next to each segment during a backup or a
//! restore. On backup it drains table data the database server writes
//! into per-oid named pipes and concatenates it into a consolidated
//! stream (or per-oid files), recording a byte-range TOC. On restore it
//! serves per-oid byte slices of that stream back through pipes, keeping
//! a bounded number of pipes ready ahead of the database's consumer.
//! An external plugin process can own the bytes on either side.

mod backup;
mod error;
mod pipes;
mod plugin;
mod restore;
mod state;

pub use backup::run_backup_agent;
pub use error::{HelperError, HelperResult};
pub use plugin::{PluginConfig, PluginProcess};
pub use restore::run_restore_agent;
pub use state::{read_oid_list, AgentKind, HelperConfig, HelperState};
