//! Backup-side data loop.
//!
//! The database server writes each table's rows into `<pipe>_<oid>`; the
//! helper drains the pipes in ascending oid order into a single
//! consolidated stream (recording a byte-range TOC) or into one file per
//! oid. TOC offsets count the bytes as they leave the pipe, before
//! compression, so the restore side can address tables by decompressed
//! position.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info};

use heron_common::toc::DataToc;

use crate::error::{HelperError, HelperResult};
use crate::plugin::PluginProcess;
use crate::state::{read_oid_list, HelperState};

/// Output stack for one stream: an optional gzip layer over a buffered
/// target. The enum exists so `finish` can flush the gzip trailer, which
/// a `Box<dyn Write>` could not express.
enum BackupSink {
    Plain(BufWriter<Box<dyn Write + Send>>),
    Gzip(GzEncoder<BufWriter<Box<dyn Write + Send>>>),
}

impl BackupSink {
    fn new(target: Box<dyn Write + Send>, compression_level: u32) -> Self {
        let buffered = BufWriter::new(target);
        if compression_level == 0 {
            BackupSink::Plain(buffered)
        } else {
            BackupSink::Gzip(GzEncoder::new(
                buffered,
                Compression::new(compression_level),
            ))
        }
    }

    /// Flush everything, including the gzip trailer, and close the target.
    fn finish(self) -> std::io::Result<()> {
        match self {
            BackupSink::Plain(mut w) => w.flush(),
            BackupSink::Gzip(gz) => gz.finish()?.flush(),
        }
    }
}

impl Write for BackupSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            BackupSink::Plain(w) => w.write(buf),
            BackupSink::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            BackupSink::Plain(w) => w.flush(),
            BackupSink::Gzip(w) => w.flush(),
        }
    }
}

/// Run the backup agent to completion.
pub fn run_backup_agent(state: &HelperState) -> HelperResult<()> {
    let config = &state.config;
    let oids = read_oid_list(&config.oid_file)?;
    state.preload_created_pipes(&oids);
    info!(
        content = config.content,
        tables = oids.len(),
        single_data_file = config.single_data_file,
        "backup agent starting"
    );

    if config.single_data_file {
        backup_consolidated(state, &oids)
    } else {
        backup_per_oid(state, &oids)
    }
}

fn backup_consolidated(state: &HelperState, oids: &[u32]) -> HelperResult<()> {
    let config = &state.config;
    let mut plugin: Option<PluginProcess> = None;

    let target: Box<dyn Write + Send> = match &config.plugin_config {
        Some(plugin_config) => {
            let (process, stdin) =
                PluginProcess::spawn_backup_stream(plugin_config, &config.data_file)?;
            plugin = Some(process);
            Box::new(stdin)
        }
        None => Box::new(File::create(&config.data_file)?),
    };
    let mut sink = BackupSink::new(target, config.compression_level);
    let mut toc = DataToc::new();

    for (i, &oid) in oids.iter().enumerate() {
        if state.was_terminated() {
            return Err(HelperError::Terminated);
        }
        // Stay one prefetch step ahead of the pipe being drained; the
        // driver already created the first `copy_prefetch` pipes.
        if i + config.copy_prefetch < oids.len() {
            state.create_pipe(oids[i + config.copy_prefetch])?;
        }

        let n = drain_one_pipe(state, oid, &mut sink)?;
        toc.add_entry(oid, n)?;
    }

    sink.finish()?;
    if let Some(process) = plugin {
        process.wait()?;
    }
    toc.write_to_file(&config.toc_file)?;
    info!(
        content = config.content,
        bytes = toc.total_bytes(),
        "backup agent finished"
    );
    Ok(())
}

fn backup_per_oid(state: &HelperState, oids: &[u32]) -> HelperResult<()> {
    let config = &state.config;
    for (i, &oid) in oids.iter().enumerate() {
        if state.was_terminated() {
            return Err(HelperError::Terminated);
        }
        if i + config.copy_prefetch < oids.len() {
            state.create_pipe(oids[i + config.copy_prefetch])?;
        }

        let path = per_oid_data_file(&config.data_file, oid, config.compression_level);
        let mut sink = BackupSink::new(
            Box::new(File::create(&path)?),
            config.compression_level,
        );
        let n = drain_one_pipe(state, oid, &mut sink)?;
        sink.finish()?;
        debug!(oid, bytes = n, file = %path.display(), "table written");
    }
    info!(content = config.content, "backup agent finished");
    Ok(())
}

/// Open the oid's pipe, block until the database opens the write end,
/// copy everything, then retire the pipe. Returns the uncompressed byte
/// count.
fn drain_one_pipe(state: &HelperState, oid: u32, sink: &mut impl Write) -> HelperResult<u64> {
    let pipe = state.pipe_path(oid);
    debug!(oid, pipe = %pipe.display(), "waiting for writer");
    let reader = File::open(&pipe)?;
    let n = std::io::copy(&mut BufReader::new(reader), sink)?;
    state.delete_pipe(&pipe)?;
    debug!(oid, bytes = n, "table drained");
    Ok(n)
}

/// Per-oid data file name; compressed files carry a `.gz` suffix.
pub(crate) fn per_oid_data_file(
    prefix: &Path,
    oid: u32,
    compression_level: u32,
) -> std::path::PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(format!("_{}", oid));
    if compression_level > 0 {
        name.push(".gz");
    }
    std::path::PathBuf::from(name)
}

/// Open a per-oid data file for reading, decompressing when needed.
pub(crate) fn open_per_oid_data_file(
    prefix: &Path,
    oid: u32,
    compression_level: u32,
) -> std::io::Result<Box<dyn Read + Send>> {
    let path = per_oid_data_file(prefix, oid, compression_level);
    let file = BufReader::new(File::open(path)?);
    if compression_level > 0 {
        Ok(Box::new(flate2::bufread::GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}
