//! Low-level FIFO I/O for the restore side.
//!
//! Opening a FIFO write end must not block forever: the database may
//! never open the read end for a table the driver has decided to skip,
//! and a termination signal has to be able to stop the helper while it
//! waits. Both are handled by a non-blocking open retry loop. Once a
//! reader exists the descriptor keeps `O_NONBLOCK`, so writes can return
//! `WouldBlock` when the pipe buffer fills; the copy loop parks briefly
//! on the termination signal and retries.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use heron_common::shutdown::TerminationSignal;

const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(25);
const WRITE_RETRY_INTERVAL: Duration = Duration::from_millis(5);
const COPY_BUF_SIZE: usize = 64 * 1024;

/// Outcome of trying to open a pipe's write end.
pub(crate) enum WriteEnd {
    /// A reader showed up; the pipe is open.
    Writer(File),
    /// A skip marker appeared while waiting for a reader.
    Skipped,
    /// Termination was requested while waiting.
    Terminated,
}

/// Open the write end of `pipe`, waiting for the database to open the
/// read end. While waiting, watch for the oid's skip marker and for
/// termination.
pub(crate) fn open_write_end(
    pipe: &Path,
    skip_marker: &Path,
    term: &TerminationSignal,
) -> std::io::Result<WriteEnd> {
    loop {
        if term.was_terminated() {
            return Ok(WriteEnd::Terminated);
        }
        if skip_marker.exists() {
            return Ok(WriteEnd::Skipped);
        }
        match OpenOptions::new()
            .write(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(pipe)
        {
            Ok(file) => return Ok(WriteEnd::Writer(file)),
            // ENXIO: no reader yet. Park and retry.
            Err(e) if e.raw_os_error() == Some(nix::libc::ENXIO) => {
                term.wait_timeout(OPEN_RETRY_INTERVAL);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Why a pipe copy stopped early.
#[derive(Debug)]
pub(crate) enum PipeCopyError {
    /// The input stream failed; always fatal.
    Read(std::io::Error),
    /// The pipe write failed. `consumed` bytes were already taken from
    /// the input stream and must be accounted for when draining the rest
    /// of the range.
    Write {
        source: std::io::Error,
        consumed: u64,
    },
    /// Termination was requested mid-copy.
    Terminated,
}

/// Copy exactly `len` bytes from `reader` into the pipe.
///
/// Returns the byte count on success. A short read from `reader` is
/// reported as a read error: the TOC promised `len` bytes, so running
/// dry means the stream is corrupt.
pub(crate) fn copy_range_to_pipe(
    reader: &mut impl Read,
    pipe: &mut File,
    len: u64,
    term: &TerminationSignal,
) -> Result<u64, PipeCopyError> {
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut consumed: u64 = 0;

    while consumed < len {
        let want = buf.len().min((len - consumed) as usize);
        let got = match reader.read(&mut buf[..want]) {
            Ok(0) => {
                return Err(PipeCopyError::Read(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("stream ended {} bytes short", len - consumed),
                )))
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(PipeCopyError::Read(e)),
        };
        consumed += got as u64;
        write_all_pipe(pipe, &buf[..got], term).map_err(|e| match e {
            WriteStop::Terminated => PipeCopyError::Terminated,
            WriteStop::Io(source) => PipeCopyError::Write { source, consumed },
        })?;
    }
    Ok(consumed)
}

/// Read and throw away exactly `len` bytes, preserving the stream's
/// position without seeking. A plugin-backed stream is not seekable, so
/// this is the only way to pass over an unwanted table.
pub(crate) fn discard_bytes(reader: &mut impl Read, len: u64) -> std::io::Result<()> {
    let copied = std::io::copy(&mut reader.take(len), &mut std::io::sink())?;
    if copied < len {
        return Err(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            format!("stream ended {} bytes short while skipping", len - copied),
        ));
    }
    Ok(())
}

enum WriteStop {
    Io(std::io::Error),
    Terminated,
}

fn write_all_pipe(
    pipe: &mut File,
    mut buf: &[u8],
    term: &TerminationSignal,
) -> Result<(), WriteStop> {
    while !buf.is_empty() {
        match pipe.write(buf) {
            Ok(0) => {
                return Err(WriteStop::Io(std::io::Error::new(
                    ErrorKind::WriteZero,
                    "pipe accepted zero bytes",
                )))
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if term.wait_timeout(WRITE_RETRY_INTERVAL) {
                    return Err(WriteStop::Terminated);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(WriteStop::Io(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_discard_bytes_advances_reader() {
        let mut reader = Cursor::new(b"abcdefgh".to_vec());
        discard_bytes(&mut reader, 5).unwrap();
        let mut rest = String::new();
        reader.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "fgh");
    }

    #[test]
    fn test_discard_bytes_detects_short_stream() {
        let mut reader = Cursor::new(b"abc".to_vec());
        let err = discard_bytes(&mut reader, 5).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_open_write_end_honours_skip_marker() {
        let dir = TempDir::new().unwrap();
        let pipe = dir.path().join("pipe_1");
        let marker = dir.path().join("pipe_skip_1");
        mkfifo(&pipe, Mode::from_bits_truncate(0o700)).unwrap();
        std::fs::File::create(&marker).unwrap();

        let term = TerminationSignal::new();
        match open_write_end(&pipe, &marker, &term).unwrap() {
            WriteEnd::Skipped => {}
            _ => panic!("expected skip"),
        }
    }

    #[test]
    fn test_open_write_end_honours_termination() {
        let dir = TempDir::new().unwrap();
        let pipe = dir.path().join("pipe_1");
        let marker = dir.path().join("pipe_skip_1");
        mkfifo(&pipe, Mode::from_bits_truncate(0o700)).unwrap();

        let term = TerminationSignal::new();
        term.terminate();
        match open_write_end(&pipe, &marker, &term).unwrap() {
            WriteEnd::Terminated => {}
            _ => panic!("expected termination"),
        }
    }

    #[test]
    fn test_open_write_end_connects_to_reader() {
        let dir = TempDir::new().unwrap();
        let pipe = dir.path().join("pipe_1");
        let marker = dir.path().join("pipe_skip_1");
        mkfifo(&pipe, Mode::from_bits_truncate(0o700)).unwrap();

        let reader_path = pipe.clone();
        let reader = std::thread::spawn(move || {
            let mut contents = String::new();
            std::fs::File::open(reader_path)
                .unwrap()
                .read_to_string(&mut contents)
                .unwrap();
            contents
        });

        let term = TerminationSignal::new();
        let mut writer = match open_write_end(&pipe, &marker, &term).unwrap() {
            WriteEnd::Writer(f) => f,
            _ => panic!("expected writer"),
        };
        let mut source = Cursor::new(b"hello pipe".to_vec());
        let n = copy_range_to_pipe(&mut source, &mut writer, 10, &term).unwrap();
        drop(writer);

        assert_eq!(n, 10);
        assert_eq!(reader.join().unwrap(), "hello pipe");
    }
}
