//! Table-of-contents model for backup artifacts.
//!
//! Two kinds of TOC exist:
//!
//! - The **data TOC** maps each table oid to a half-open byte range inside
//!   the consolidated data stream of one segment. Offsets are measured on
//!   the uncompressed stream, so a restore can address table boundaries by
//!   decompressed position even when the stream on disk is gzipped.
//! - The **metadata TOC** maps each DDL object to a byte range inside a
//!   metadata SQL file, letting the restore executor slice out exactly the
//!   statements it needs.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from TOC construction and (de)serialization.
#[derive(Error, Debug)]
pub enum TocError {
    #[error("oid {oid} is not greater than the last recorded oid {last}")]
    OutOfOrderOid { oid: u32, last: u32 },

    #[error("oid {0} not present in table of contents")]
    OidNotFound(u32),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed table of contents: {0}")]
    Format(#[from] serde_yaml::Error),
}

// ── Data TOC ────────────────────────────────────────────────────────────────

/// One table's byte range in the consolidated data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEntry {
    pub oid: u32,
    pub start_byte: u64,
    pub end_byte: u64,
}

impl DataEntry {
    /// Length of the range in uncompressed bytes.
    pub fn len(&self) -> u64 {
        self.end_byte - self.start_byte
    }

    pub fn is_empty(&self) -> bool {
        self.end_byte == self.start_byte
    }
}

/// Per-segment data TOC. Entries are oid-ascending; ranges are half-open
/// and gapless when no oid was skipped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataToc {
    pub entries: Vec<DataEntry>,
}

impl DataToc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next table's range. `len` is the uncompressed byte count
    /// drained for this oid; the range starts where the previous one ended.
    pub fn add_entry(&mut self, oid: u32, len: u64) -> Result<(), TocError> {
        let start = match self.entries.last() {
            Some(last) if oid <= last.oid => {
                return Err(TocError::OutOfOrderOid {
                    oid,
                    last: last.oid,
                })
            }
            Some(last) => last.end_byte,
            None => 0,
        };
        self.entries.push(DataEntry {
            oid,
            start_byte: start,
            end_byte: start + len,
        });
        Ok(())
    }

    /// Look up the range for one oid.
    pub fn entry(&self, oid: u32) -> Result<DataEntry, TocError> {
        self.entries
            .binary_search_by_key(&oid, |e| e.oid)
            .map(|i| self.entries[i])
            .map_err(|_| TocError::OidNotFound(oid))
    }

    /// All oids in the TOC, ascending.
    pub fn oids(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.oid).collect()
    }

    /// Total uncompressed bytes covered by the stream.
    pub fn total_bytes(&self) -> u64 {
        self.entries.last().map(|e| e.end_byte).unwrap_or(0)
    }

    pub fn write_to_file(&self, path: &Path) -> Result<(), TocError> {
        let file = File::create(path).map_err(|source| TocError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::to_writer(file, self)?;
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Self, TocError> {
        let file = File::open(path).map_err(|source| TocError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_yaml::from_reader(BufReader::new(file))?)
    }
}

// ── Metadata TOC and statements ─────────────────────────────────────────────

/// One DDL object's byte range in a metadata SQL file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub schema: String,
    pub name: String,
    pub object_type: String,
    #[serde(default)]
    pub reference_object: String,
    #[serde(default)]
    pub tier: u32,
    pub start_byte: u64,
    pub end_byte: u64,
}

/// A recorded SQL statement ready for replay.
///
/// `tier` orders pre-data statements into dependency layers; statement
/// "type" equality, used by the executor's worker distribution, compares
/// `object_type` only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementWithType {
    pub schema: String,
    pub name: String,
    pub object_type: String,
    #[serde(default)]
    pub reference_object: String,
    #[serde(default)]
    pub tier: u32,
    pub statement: String,
}

impl StatementWithType {
    pub fn type_is_equal(&self, other: &StatementWithType) -> bool {
        self.object_type == other.object_type
    }

    /// `schema.name`, the key used for error-table accounting.
    pub fn fq_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Metadata TOC for one backup: object entries partitioned by section, in
/// file order within each section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataToc {
    #[serde(default)]
    pub global_entries: Vec<MetadataEntry>,
    #[serde(default)]
    pub predata_entries: Vec<MetadataEntry>,
    #[serde(default)]
    pub postdata_entries: Vec<MetadataEntry>,
}

impl MetadataToc {
    pub fn write_to_file(&self, path: &Path) -> Result<(), TocError> {
        let file = File::create(path).map_err(|source| TocError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::to_writer(file, self)?;
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Self, TocError> {
        let file = File::open(path).map_err(|source| TocError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_yaml::from_reader(BufReader::new(file))?)
    }
}

/// Slice the recorded statements for `entries` out of a metadata SQL file.
///
/// When `include_objects` is non-empty, only entries whose `schema.name`
/// appears in it are returned. Order follows `entries`.
pub fn statements_from_file(
    sql_path: &Path,
    entries: &[MetadataEntry],
    include_objects: &[String],
) -> Result<Vec<StatementWithType>, TocError> {
    let filter: HashSet<&str> = include_objects.iter().map(String::as_str).collect();
    let mut file = File::open(sql_path).map_err(|source| TocError::Io {
        path: sql_path.to_path_buf(),
        source,
    })?;

    let mut statements = Vec::new();
    for entry in entries {
        if !filter.is_empty() && !filter.contains(format!("{}.{}", entry.schema, entry.name).as_str())
        {
            continue;
        }
        file.seek(SeekFrom::Start(entry.start_byte))
            .map_err(|source| TocError::Io {
                path: sql_path.to_path_buf(),
                source,
            })?;
        let mut buf = vec![0u8; (entry.end_byte - entry.start_byte) as usize];
        file.read_exact(&mut buf).map_err(|source| TocError::Io {
            path: sql_path.to_path_buf(),
            source,
        })?;
        statements.push(StatementWithType {
            schema: entry.schema.clone(),
            name: entry.name.clone(),
            object_type: entry.object_type.clone(),
            reference_object: entry.reference_object.clone(),
            tier: entry.tier,
            statement: String::from_utf8_lossy(&buf).into_owned(),
        });
    }
    Ok(statements)
}

/// Append one statement to a metadata SQL file, returning its TOC entry.
#[allow(clippy::too_many_arguments)]
pub fn record_statement(
    sql_file: &mut (impl Write + Seek),
    cursor: &mut u64,
    schema: &str,
    name: &str,
    object_type: &str,
    reference_object: &str,
    tier: u32,
    statement: &str,
) -> Result<MetadataEntry, std::io::Error> {
    let start = *cursor;
    sql_file.write_all(statement.as_bytes())?;
    *cursor += statement.len() as u64;
    Ok(MetadataEntry {
        schema: schema.to_string(),
        name: name.to_string(),
        object_type: object_type.to_string(),
        reference_object: reference_object.to_string(),
        tier,
        start_byte: start,
        end_byte: *cursor,
    })
}
