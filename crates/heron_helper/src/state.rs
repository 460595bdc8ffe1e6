//! Helper process state: configuration, the pipe registry, and cleanup.
//!
//! The registry tracks every FIFO the helper currently owns. Every pipe
//! is registered the moment it exists and removed on every exit path, so
//! that after a clean run or a signal the registry is empty on disk. The
//! state is shared between the data loop and the signal handler; cleanup
//! runs exactly once no matter which of them gets there first.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use parking_lot::Mutex;
use tracing::{debug, warn};

use heron_common::shutdown::TerminationSignal;

use crate::error::{HelperError, HelperResult};

/// Which side of a backup this helper process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Backup,
    Restore,
}

/// Parsed helper configuration, one per process.
#[derive(Debug, Clone)]
pub struct HelperConfig {
    pub agent: AgentKind,
    /// Content id of the segment this helper is co-located with.
    pub content: i32,
    /// Gzip level 1..=9; 0 means no compression.
    pub compression_level: u32,
    /// Consolidated stream path, or the per-oid file prefix.
    pub data_file: PathBuf,
    /// File listing the oids to back up or restore, one per line.
    pub oid_file: PathBuf,
    /// FIFO name prefix; pipes are `<prefix>_<oid>`.
    pub pipe_file: PathBuf,
    /// Data TOC path.
    pub toc_file: PathBuf,
    /// Plugin config path; when set the plugin owns the bytes.
    pub plugin_config: Option<PathBuf>,
    /// Restore only: serve just the oids in the oid list.
    pub with_filters: bool,
    /// How many FIFOs to keep ready ahead of the database consumer.
    pub copy_prefetch: usize,
    /// Restore only: tolerate the database aborting individual copies.
    pub on_error_continue: bool,
    /// Consolidated stream mode (vs one file per oid).
    pub single_data_file: bool,
}

/// Shared helper state. The signal handler holds a clone of the `Arc`
/// around this and is the only writer to the termination flag.
pub struct HelperState {
    pub config: HelperConfig,
    pipes: Mutex<BTreeSet<PathBuf>>,
    term: TerminationSignal,
    cleanup_ran: AtomicBool,
}

impl HelperState {
    pub fn new(mut config: HelperConfig) -> Self {
        // A zero queue depth cannot make progress; the floor is one pipe
        // in flight.
        config.copy_prefetch = config.copy_prefetch.max(1);
        Self {
            config,
            pipes: Mutex::new(BTreeSet::new()),
            term: TerminationSignal::new(),
            cleanup_ran: AtomicBool::new(false),
        }
    }

    pub fn termination(&self) -> &TerminationSignal {
        &self.term
    }

    pub fn was_terminated(&self) -> bool {
        self.term.was_terminated()
    }

    // ── FIFO naming ─────────────────────────────────────────────────────

    pub fn pipe_path(&self, oid: u32) -> PathBuf {
        suffixed(&self.config.pipe_file, &format!("_{}", oid))
    }

    pub fn skip_marker_path(&self, oid: u32) -> PathBuf {
        suffixed(&self.config.pipe_file, &format!("_skip_{}", oid))
    }

    pub fn error_sentinel_path(&self) -> PathBuf {
        suffixed(&self.config.pipe_file, "_error")
    }

    // ── Registry ────────────────────────────────────────────────────────

    /// Create the FIFO for `oid` and register it.
    pub fn create_pipe(&self, oid: u32) -> HelperResult<PathBuf> {
        let path = self.pipe_path(oid);
        mkfifo(&path, Mode::from_bits_truncate(0o700))?;
        self.pipes.lock().insert(path.clone());
        debug!(oid, pipe = %path.display(), "created pipe");
        Ok(path)
    }

    /// Remove a FIFO from disk and from the registry.
    pub fn delete_pipe(&self, path: &Path) -> HelperResult<()> {
        remove_file_if_exists(path)?;
        self.pipes.lock().remove(path);
        Ok(())
    }

    /// Record the first `copy_prefetch` pipes as already created by the
    /// driver. They exist before the helper starts so the database never
    /// opens a pipe that is not there yet.
    pub fn preload_created_pipes(&self, oids: &[u32]) {
        let prefetched = oids.len().min(self.config.copy_prefetch);
        let mut pipes = self.pipes.lock();
        for &oid in &oids[..prefetched] {
            pipes.insert(self.pipe_path(oid));
        }
    }

    /// Snapshot of the registry, for invariant checks.
    pub fn registered_pipes(&self) -> Vec<PathBuf> {
        self.pipes.lock().iter().cloned().collect()
    }

    // ── Cleanup ─────────────────────────────────────────────────────────

    /// Create the empty `_error` sentinel so the driver can detect an
    /// apparently-clean exit that actually failed.
    pub fn write_error_sentinel(&self) {
        let path = self.error_sentinel_path();
        if let Err(e) = OpenOptions::new().create(true).append(true).open(&path) {
            warn!(path = %path.display(), "could not write error sentinel: {}", e);
        }
    }

    /// Remove every registered FIFO and any stray skip markers. Runs at
    /// most once; `unclean` additionally writes the `_error` sentinel
    /// first so it is present even if sentinel readers race the removal
    /// loop.
    pub fn cleanup(&self, unclean: bool) {
        if self.cleanup_ran.swap(true, Ordering::SeqCst) {
            return;
        }
        if unclean {
            self.write_error_sentinel();
        }

        let pipes: Vec<PathBuf> = {
            let mut registry = self.pipes.lock();
            std::mem::take(&mut *registry).into_iter().collect()
        };
        for pipe in pipes {
            match remove_file_if_exists(&pipe) {
                Ok(()) => debug!(pipe = %pipe.display(), "removed pipe"),
                Err(e) => warn!(pipe = %pipe.display(), "error removing pipe: {}", e),
            }
        }

        self.remove_skip_markers();
        debug!("cleanup complete");
    }

    fn remove_skip_markers(&self) {
        let Some(parent) = self.config.pipe_file.parent() else {
            return;
        };
        let prefix = match self.config.pipe_file.file_name() {
            Some(name) => format!("{}_skip_", name.to_string_lossy()),
            None => return,
        };
        let Ok(entries) = std::fs::read_dir(parent) else {
            return;
        };
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                if let Err(e) = remove_file_if_exists(&entry.path()) {
                    warn!(path = %entry.path().display(), "error removing skip marker: {}", e);
                }
            }
        }
    }
}

/// Parse the oid list file: one oid per line, returned ascending.
pub fn read_oid_list(path: &Path) -> HelperResult<Vec<u32>> {
    let contents = std::fs::read_to_string(path)?;
    let mut oids = Vec::new();
    for token in contents.split_whitespace() {
        let oid = token.parse::<u32>().map_err(|_| HelperError::InvalidOid {
            token: token.to_string(),
            path: path.to_path_buf(),
        })?;
        oids.push(oid);
    }
    if oids.is_empty() {
        return Err(HelperError::EmptyOidList(path.to_path_buf()));
    }
    oids.sort_unstable();
    Ok(oids)
}

fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn suffixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn test_config(dir: &Path, agent: AgentKind) -> HelperConfig {
        HelperConfig {
            agent,
            content: 0,
            compression_level: 0,
            data_file: dir.join("data"),
            oid_file: dir.join("oids"),
            pipe_file: dir.join("pipe"),
            toc_file: dir.join("toc.yaml"),
            plugin_config: None,
            with_filters: false,
            copy_prefetch: 1,
            on_error_continue: false,
            single_data_file: true,
        }
    }

    #[test]
    fn test_pipe_naming() {
        let dir = TempDir::new().unwrap();
        let state = HelperState::new(test_config(dir.path(), AgentKind::Backup));
        assert_eq!(state.pipe_path(1001), dir.path().join("pipe_1001"));
        assert_eq!(state.skip_marker_path(7), dir.path().join("pipe_skip_7"));
        assert_eq!(state.error_sentinel_path(), dir.path().join("pipe_error"));
    }

    #[test]
    fn test_create_and_delete_pipe_tracks_registry() {
        let dir = TempDir::new().unwrap();
        let state = HelperState::new(test_config(dir.path(), AgentKind::Backup));

        let pipe = state.create_pipe(42).unwrap();
        assert!(pipe.exists());
        assert_eq!(state.registered_pipes(), vec![pipe.clone()]);

        state.delete_pipe(&pipe).unwrap();
        assert!(!pipe.exists());
        assert!(state.registered_pipes().is_empty());
    }

    #[test]
    fn test_preload_marks_only_first_prefetch_pipes() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path(), AgentKind::Backup);
        config.copy_prefetch = 2;
        let state = HelperState::new(config);

        state.preload_created_pipes(&[1, 2, 3, 4]);
        assert_eq!(
            state.registered_pipes(),
            vec![state.pipe_path(1), state.pipe_path(2)]
        );
    }

    #[test]
    fn test_cleanup_empties_registry_and_removes_markers() {
        let dir = TempDir::new().unwrap();
        let state = HelperState::new(test_config(dir.path(), AgentKind::Restore));

        let pipe = state.create_pipe(9).unwrap();
        File::create(state.skip_marker_path(9)).unwrap();

        state.cleanup(false);
        assert!(!pipe.exists());
        assert!(!state.skip_marker_path(9).exists());
        assert!(state.registered_pipes().is_empty());
        assert!(!state.error_sentinel_path().exists());
    }

    #[test]
    fn test_unclean_cleanup_writes_sentinel_once() {
        let dir = TempDir::new().unwrap();
        let state = HelperState::new(test_config(dir.path(), AgentKind::Restore));

        state.cleanup(true);
        assert!(state.error_sentinel_path().exists());

        // Second call is a no-op even if the sentinel is gone.
        std::fs::remove_file(state.error_sentinel_path()).unwrap();
        state.cleanup(true);
        assert!(!state.error_sentinel_path().exists());
    }

    #[test]
    fn test_read_oid_list_sorts_ascending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oids");
        std::fs::write(&path, "1003\n1001\n1002\n").unwrap();
        assert_eq!(read_oid_list(&path).unwrap(), vec![1001, 1002, 1003]);
    }

    #[test]
    fn test_read_oid_list_rejects_garbage_and_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oids");

        std::fs::write(&path, "12\nnot_an_oid\n").unwrap();
        let err = read_oid_list(&path).unwrap_err();
        assert!(matches!(err, HelperError::InvalidOid { ref token, .. } if token == "not_an_oid"));

        std::fs::write(&path, "\n").unwrap();
        assert!(matches!(
            read_oid_list(&path).unwrap_err(),
            HelperError::EmptyOidList(_)
        ));
    }
}
