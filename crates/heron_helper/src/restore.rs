//! Restore-side data loop.
//!
//! The helper reads the consolidated stream (local file or plugin
//! stdout), decompresses if needed, and serves each table's byte slice
//! through its FIFO. The stream is consumed strictly forward; tables
//! that are filtered out or skipped are passed over by read-and-discard,
//! which keeps the positional invariant without seeking. Seeking is not
//! an option anyway: a plugin-backed stream has no file behind it.
//!
//! The copy queue keeps at most `copy_prefetch` FIFOs in existence ahead
//! of the one the database is consuming. The driver creates the first
//! `copy_prefetch` pipes before the helper starts; each time the helper
//! finishes a table it creates the pipe `copy_prefetch` positions ahead
//! and removes the one it just served.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};

use flate2::bufread::GzDecoder;
use tracing::{debug, info, warn};

use heron_common::toc::{DataEntry, DataToc};

use crate::backup::open_per_oid_data_file;
use crate::error::{HelperError, HelperResult};
use crate::pipes::{copy_range_to_pipe, discard_bytes, open_write_end, PipeCopyError, WriteEnd};
use crate::plugin::PluginProcess;
use crate::state::{read_oid_list, HelperState};

/// Input stack for the consolidated stream: an optional gzip layer over
/// a buffered source.
enum RestoreSource {
    Plain(BufReader<Box<dyn Read + Send>>),
    Gzip(GzDecoder<BufReader<Box<dyn Read + Send>>>),
}

impl RestoreSource {
    fn new(source: Box<dyn Read + Send>, compression_level: u32) -> Self {
        let buffered = BufReader::new(source);
        if compression_level == 0 {
            RestoreSource::Plain(buffered)
        } else {
            RestoreSource::Gzip(GzDecoder::new(buffered))
        }
    }
}

impl Read for RestoreSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            RestoreSource::Plain(r) => r.read(buf),
            RestoreSource::Gzip(r) => r.read(buf),
        }
    }
}

/// Run the restore agent to completion.
pub fn run_restore_agent(state: &HelperState) -> HelperResult<()> {
    if state.config.single_data_file {
        restore_consolidated(state)
    } else {
        restore_per_oid(state)
    }
}

fn restore_consolidated(state: &HelperState) -> HelperResult<()> {
    let config = &state.config;
    let toc = DataToc::read_from_file(&config.toc_file)?;
    let requested = read_oid_list(&config.oid_file)?;

    // The serve list is what flows through FIFOs; everything else in the
    // TOC is drained and discarded to hold the stream position.
    let serve: Vec<u32> = if config.with_filters {
        let in_toc: HashSet<u32> = toc.oids().into_iter().collect();
        let (known, unknown): (Vec<u32>, Vec<u32>) =
            requested.into_iter().partition(|oid| in_toc.contains(oid));
        for oid in unknown {
            warn!(oid, "filtered oid not present in backup; ignoring");
        }
        known
    } else {
        toc.oids()
    };
    let serve_set: HashSet<u32> = serve.iter().copied().collect();
    state.preload_created_pipes(&serve);
    info!(
        content = config.content,
        tables = serve.len(),
        filtered = config.with_filters,
        "restore agent starting"
    );

    let mut plugin: Option<PluginProcess> = None;
    let raw: Box<dyn Read + Send> = match &config.plugin_config {
        Some(plugin_config) => {
            let (process, stdout) =
                PluginProcess::spawn_restore_stream(plugin_config, &config.data_file)?;
            plugin = Some(process);
            Box::new(stdout)
        }
        None => Box::new(File::open(&config.data_file)?),
    };
    let mut source = RestoreSource::new(raw, config.compression_level);

    let mut serve_idx = 0usize;
    for entry in &toc.entries {
        if state.was_terminated() {
            return Err(HelperError::Terminated);
        }
        if !serve_set.contains(&entry.oid) {
            discard_bytes(&mut source, entry.len()).map_err(HelperError::StreamRead)?;
            continue;
        }

        serve_entry(state, &mut source, entry)?;

        // Advance the copy queue: bring the next pipe into existence,
        // retire the one just consumed.
        if serve_idx + config.copy_prefetch < serve.len() {
            state.create_pipe(serve[serve_idx + config.copy_prefetch])?;
        }
        state.delete_pipe(&state.pipe_path(entry.oid))?;
        serve_idx += 1;
    }

    drop(source);
    if let Some(process) = plugin {
        process.wait()?;
    }
    info!(content = config.content, "restore agent finished");
    Ok(())
}

/// Serve one TOC entry through its FIFO, honouring skip markers and the
/// on-error-continue policy.
fn serve_entry(
    state: &HelperState,
    source: &mut RestoreSource,
    entry: &DataEntry,
) -> HelperResult<()> {
    let config = &state.config;
    let oid = entry.oid;
    let len = entry.len();
    let pipe = state.pipe_path(oid);
    let term = state.termination();

    debug!(oid, bytes = len, "waiting for reader");
    match open_write_end(&pipe, &state.skip_marker_path(oid), term)? {
        WriteEnd::Terminated => Err(HelperError::Terminated),
        WriteEnd::Skipped => {
            info!(oid, "skip marker present; discarding table");
            discard_bytes(source, len).map_err(HelperError::StreamRead)?;
            Ok(())
        }
        WriteEnd::Writer(mut writer) => {
            match copy_range_to_pipe(source, &mut writer, len, term) {
                Ok(n) => {
                    debug!(oid, bytes = n, "table served");
                    Ok(())
                }
                Err(PipeCopyError::Read(e)) => Err(HelperError::StreamRead(e)),
                Err(PipeCopyError::Terminated) => Err(HelperError::Terminated),
                Err(PipeCopyError::Write { source: e, consumed }) => {
                    // The database closing its read end mid-copy means it
                    // aborted this table; tolerated only when the driver
                    // is continuing past per-table errors.
                    if config.on_error_continue
                        && e.kind() == std::io::ErrorKind::BrokenPipe
                    {
                        warn!(oid, "reader closed pipe early; discarding rest of table");
                        discard_bytes(source, len - consumed)
                            .map_err(HelperError::StreamRead)?;
                        Ok(())
                    } else {
                        Err(HelperError::PipeWrite { oid, source: e })
                    }
                }
            }
        }
    }
}

fn restore_per_oid(state: &HelperState) -> HelperResult<()> {
    let config = &state.config;
    let serve = read_oid_list(&config.oid_file)?;
    state.preload_created_pipes(&serve);
    info!(
        content = config.content,
        tables = serve.len(),
        "restore agent starting (per-oid files)"
    );

    for (i, &oid) in serve.iter().enumerate() {
        if state.was_terminated() {
            return Err(HelperError::Terminated);
        }

        serve_per_oid_file(state, oid)?;

        if i + config.copy_prefetch < serve.len() {
            state.create_pipe(serve[i + config.copy_prefetch])?;
        }
        state.delete_pipe(&state.pipe_path(oid))?;
    }
    info!(content = config.content, "restore agent finished");
    Ok(())
}

fn serve_per_oid_file(state: &HelperState, oid: u32) -> HelperResult<()> {
    let config = &state.config;
    let pipe = state.pipe_path(oid);
    let term = state.termination();

    match open_write_end(&pipe, &state.skip_marker_path(oid), term)? {
        WriteEnd::Terminated => Err(HelperError::Terminated),
        WriteEnd::Skipped => {
            info!(oid, "skip marker present; not serving table");
            Ok(())
        }
        WriteEnd::Writer(mut writer) => {
            let mut source =
                open_per_oid_data_file(&config.data_file, oid, config.compression_level)?;
            match stream_to_pipe(&mut *source, &mut writer, state) {
                Ok(n) => {
                    debug!(oid, bytes = n, "table served");
                    Ok(())
                }
                Err(PipeCopyError::Read(e)) => Err(HelperError::StreamRead(e)),
                Err(PipeCopyError::Terminated) => Err(HelperError::Terminated),
                Err(PipeCopyError::Write { source: e, .. }) => {
                    if config.on_error_continue
                        && e.kind() == std::io::ErrorKind::BrokenPipe
                    {
                        warn!(oid, "reader closed pipe early");
                        Ok(())
                    } else {
                        Err(HelperError::PipeWrite { oid, source: e })
                    }
                }
            }
        }
    }
}

/// Copy an entire per-oid file into the pipe; the length is whatever the
/// file holds.
fn stream_to_pipe(
    source: &mut dyn Read,
    pipe: &mut File,
    state: &HelperState,
) -> Result<u64, PipeCopyError> {
    let term = state.termination();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let got = match source.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PipeCopyError::Read(e)),
        };
        let mut chunk = std::io::Cursor::new(&buf[..got]);
        copy_range_to_pipe(&mut chunk, pipe, got as u64, term)?;
        total += got as u64;
    }
}
