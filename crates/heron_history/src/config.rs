//! Per-backup configuration record.
//!
//! One `BackupConfig` is created when a backup completes and is immutable
//! from then on. It is written twice: as a YAML document alongside the
//! backup artifacts, and as a row set in the history database. Restore
//! reads it to decide admissibility and to source each relation from the
//! right timestamp.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::HistoryError;
use crate::section::Sections;

/// One entry of a restore plan: the backup timestamp that holds the data
/// for a set of relations. The plan is ordered; later entries may source
/// relations from more recent backups (composite multi-timestamp
/// restores).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorePlanEntry {
    pub timestamp: String,
    #[serde(default)]
    pub table_fqns: Vec<String>,
}

/// Everything recorded about one completed backup.
///
/// The legacy `metadata_only`/`data_only` booleans describe backups taken
/// before the sections bitmask existed; `recorded_sections` normalizes
/// them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    pub timestamp: String,
    pub database_name: String,
    #[serde(default)]
    pub include_relations: Vec<String>,
    #[serde(default)]
    pub exclude_relations: Vec<String>,
    #[serde(default)]
    pub include_schemas: Vec<String>,
    #[serde(default)]
    pub exclude_schemas: Vec<String>,
    #[serde(default)]
    pub restore_plan: Vec<RestorePlanEntry>,
    #[serde(default)]
    pub sections: Sections,
    #[serde(default)]
    pub metadata_only: bool,
    #[serde(default)]
    pub data_only: bool,
}

impl BackupConfig {
    /// Sections present in this backup, with pre-sections-era configs
    /// normalized from their legacy flags.
    pub fn recorded_sections(&self) -> Sections {
        let mut sections = Sections::new();
        if !self.sections.is_empty() {
            sections.set(self.sections);
        } else if self.metadata_only {
            sections.set(Sections::PREDATA | Sections::POSTDATA);
        } else if self.data_only {
            sections.set(Sections::DATA);
        }
        sections
    }

    /// Write the YAML document for this backup.
    pub fn write_document(&self, path: &Path) -> Result<(), HistoryError> {
        let file = File::create(path)?;
        serde_yaml::to_writer(file, self)?;
        Ok(())
    }

    /// Read a backup's YAML document. Unknown fields are ignored, so newer
    /// tools can read documents written by older ones and vice versa.
    pub fn read_document(path: &Path) -> Result<Self, HistoryError> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(BufReader::new(file))?)
    }
}
