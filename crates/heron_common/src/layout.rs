//! On-disk layout of a backup set.
//!
//! Per segment, a backup set lives under
//! `<data-dir>/backups/<YYYYMMDD>/<timestamp>/` and contains the
//! consolidated data file (or per-oid files), the data TOC, the metadata
//! SQL files, the report, and the BackupConfig document. The FIFO
//! rendezvous files are transient and live directly under the segment
//! data directory, keyed by content id and timestamp.

use std::path::{Path, PathBuf};

/// Directory holding all artifacts of one backup set on one segment.
pub fn backup_directory(data_dir: &Path, timestamp: &str) -> PathBuf {
    let date = &timestamp[..timestamp.len().min(8)];
    data_dir.join("backups").join(date).join(timestamp)
}

/// Consolidated data stream for one segment, or the prefix for per-oid
/// data files (`<path>_<oid>`).
pub fn data_file_path(data_dir: &Path, content_id: i32, timestamp: &str) -> PathBuf {
    backup_directory(data_dir, timestamp).join(format!("heron_{}_{}", content_id, timestamp))
}

/// Data TOC for one segment.
pub fn toc_file_path(data_dir: &Path, content_id: i32, timestamp: &str) -> PathBuf {
    backup_directory(data_dir, timestamp)
        .join(format!("heron_{}_{}_toc.yaml", content_id, timestamp))
}

/// Oid list handed to the helper agent.
pub fn oid_file_path(data_dir: &Path, content_id: i32, timestamp: &str) -> PathBuf {
    data_dir.join(format!("heron_{}_{}_oids", content_id, timestamp))
}

/// Prefix for the per-oid FIFOs; the actual pipes are `<prefix>_<oid>`.
pub fn pipe_file_prefix(data_dir: &Path, content_id: i32, timestamp: &str) -> PathBuf {
    data_dir.join(format!("heron_{}_{}_pipe", content_id, timestamp))
}

/// BackupConfig document, written on the coordinator only.
pub fn config_document_path(data_dir: &Path, timestamp: &str) -> PathBuf {
    backup_directory(data_dir, timestamp).join(format!("heron_{}_config.yaml", timestamp))
}

/// Human-readable backup report, written on the coordinator only.
pub fn report_file_path(data_dir: &Path, timestamp: &str) -> PathBuf {
    backup_directory(data_dir, timestamp).join(format!("heron_{}_report", timestamp))
}
