//! Backup sections bitmask.
//!
//! A backup contains up to three sections: pre-data DDL, table data, and
//! post-data DDL. The set is encoded as a bitmask, stored in both the
//! backup configuration document and the history database, and compared
//! at restore time against the sections the user asked for to decide
//! whether the request is admissible.
//!
//! Encoding:
//!
//! | Binary | Integer | Sections                  |
//! |--------|---------|---------------------------|
//! | 0000   | 0       | empty                     |
//! | 0001   | 1       | predata                   |
//! | 0010   | 2       | data                      |
//! | 0100   | 4       | postdata                  |
//! | 0111   | 7       | predata, data, postdata   |
//!
//! Additional sections may be added in the future.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::BackupConfig;

const PREDATA_STR: &str = "predata";
const DATA_STR: &str = "data";
const POSTDATA_STR: &str = "postdata";

/// Section-model errors: parse failures, invalid flag combinations, and
/// restore admission failures.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SectionError {
    #[error("No sections provided")]
    NoSectionsProvided,

    #[error("Unrecognized section name: {0}")]
    UnrecognizedSection(String),

    #[error("No section flags provided")]
    NoSectionFlags,

    #[error("Cannot use --{0} without section: data")]
    RequiresDataSection(&'static str),

    #[error("Cannot use --{0} without section: predata")]
    RequiresPredataSection(&'static str),

    #[error("Cannot restore: [{requested}] from backup containing: [{recorded}]")]
    NotInBackup { requested: String, recorded: String },

    #[error("Empty backup config")]
    EmptyBackupConfig,
}

/// The set of sections present in a backup, or requested for one.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sections(u32);

impl Sections {
    pub const EMPTY: Sections = Sections(0);
    pub const PREDATA: Sections = Sections(1);
    pub const DATA: Sections = Sections(1 << 1);
    pub const POSTDATA: Sections = Sections(1 << 2);
    pub const ALL: Sections = Sections(1 | 1 << 1 | 1 << 2);

    pub fn new() -> Self {
        Self::EMPTY
    }

    pub fn set(&mut self, value: Sections) {
        self.0 |= value.0;
    }

    pub fn clear(&mut self, value: Sections) {
        self.0 &= !value.0;
    }

    /// Does this set include every section of `value`?
    pub fn contains(self, value: Sections) -> bool {
        self.0 & value.0 == value.0
    }

    /// Bit-exact equality.
    pub fn is(self, value: Sections) -> bool {
        self == value
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Sections(bits)
    }

    /// Parse section names. Case-insensitive; `-`, `=`, and spaces are
    /// ignored inside each token.
    pub fn from_tokens<I, S>(&mut self, tokens: I) -> Result<(), SectionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for token in tokens {
            let cleaned: String = token
                .as_ref()
                .to_lowercase()
                .chars()
                .filter(|c| !matches!(c, ' ' | '-' | '='))
                .collect();
            match cleaned.as_str() {
                PREDATA_STR => self.set(Sections::PREDATA),
                DATA_STR => self.set(Sections::DATA),
                POSTDATA_STR => self.set(Sections::POSTDATA),
                "" => return Err(SectionError::NoSectionsProvided),
                other => return Err(SectionError::UnrecognizedSection(other.to_string())),
            }
        }
        Ok(())
    }

    /// Resolve the section flags for a backup. With no section flags at
    /// all, a backup covers everything. `--incremental` and
    /// `--leaf-partition-data` only make sense when table data is
    /// included.
    pub fn set_backup(&mut self, flags: &BackupFlags) -> Result<(), SectionError> {
        self.parse_flags(&flags.sections, flags.metadata_only, flags.data_only)?;

        if self.is_empty() {
            self.set(Sections::ALL);
        }

        if !self.contains(Sections::DATA) {
            if flags.incremental {
                return Err(SectionError::RequiresDataSection("incremental"));
            }
            if flags.leaf_partition_data {
                return Err(SectionError::RequiresDataSection("leaf-partition-data"));
            }
        }

        Ok(())
    }

    /// Resolve the section flags for a restore against the recorded
    /// backup, in four cases:
    ///
    /// 1. nothing requested, nothing recorded: restore everything;
    /// 2. nothing requested, sections recorded: restore what was recorded;
    /// 3. sections requested without predata: `--create-db` and
    ///    `--with-globals` are rejected;
    /// 4. sections requested, sections recorded: admissible iff the
    ///    recorded set is a superset of the request.
    ///
    /// A pre-sections-era backup is normalized from its legacy
    /// metadata-only/data-only flags before admission.
    pub fn set_restore(
        &mut self,
        flags: &RestoreFlags,
        config: Option<&BackupConfig>,
    ) -> Result<(), SectionError> {
        let config = config.ok_or(SectionError::EmptyBackupConfig)?;
        let recorded = config.recorded_sections();

        self.parse_flags(&flags.sections, flags.metadata_only, flags.data_only)?;

        if self.is_empty() {
            if recorded.is_empty() {
                debug!("Restoring all sections");
                self.set(Sections::ALL);
            } else {
                self.set(recorded);
                debug!("Restoring sections: [{}]", self);
            }
            return Ok(());
        } else if !self.contains(Sections::PREDATA) {
            if flags.create_db {
                return Err(SectionError::RequiresPredataSection("create-db"));
            }
            if flags.with_globals {
                return Err(SectionError::RequiresPredataSection("with-globals"));
            }
        }

        // A full backup taken before the sections feature records nothing
        // and restricts nothing.
        if recorded.is_empty() {
            debug!("Restoring [{}] from backup without section information", self);
            return Ok(());
        }

        if !recorded.contains(*self) {
            return Err(SectionError::NotInBackup {
                requested: self.to_string(),
                recorded: recorded.to_string(),
            });
        }

        Ok(())
    }

    fn parse_flags(
        &mut self,
        sections: &Option<Vec<String>>,
        metadata_only: bool,
        data_only: bool,
    ) -> Result<(), SectionError> {
        if let Some(tokens) = sections {
            if tokens.is_empty() {
                return Err(SectionError::NoSectionFlags);
            }
            self.from_tokens(tokens)?;
        } else if metadata_only {
            self.set(Sections::PREDATA | Sections::POSTDATA);
        } else if data_only {
            self.set(Sections::DATA);
        }
        Ok(())
    }
}

impl std::ops::BitOr for Sections {
    type Output = Sections;
    fn bitor(self, rhs: Sections) -> Sections {
        Sections(self.0 | rhs.0)
    }
}

impl std::fmt::Display for Sections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.contains(Sections::PREDATA) {
            names.push(PREDATA_STR);
        }
        if self.contains(Sections::DATA) {
            names.push(DATA_STR);
        }
        if self.contains(Sections::POSTDATA) {
            names.push(POSTDATA_STR);
        }
        write!(f, "{}", names.join(", "))
    }
}

/// Section-relevant backup flags, populated by the CLI layer.
#[derive(Debug, Clone, Default)]
pub struct BackupFlags {
    /// `--section` values; `Some(vec![])` means the flag was given with no
    /// arguments.
    pub sections: Option<Vec<String>>,
    pub metadata_only: bool,
    pub data_only: bool,
    pub incremental: bool,
    pub leaf_partition_data: bool,
}

/// Section-relevant restore flags, populated by the CLI layer.
#[derive(Debug, Clone, Default)]
pub struct RestoreFlags {
    pub sections: Option<Vec<String>>,
    pub metadata_only: bool,
    pub data_only: bool,
    pub create_db: bool,
    pub with_globals: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section_flags(names: &[&str]) -> Option<Vec<String>> {
        Some(names.iter().map(|s| s.to_string()).collect())
    }

    fn config_with(sections: Sections) -> BackupConfig {
        BackupConfig {
            sections,
            ..BackupConfig::default()
        }
    }

    // All seven non-empty subsets, in mask order.
    const LATTICE: [Sections; 7] = [
        Sections::PREDATA,
        Sections::DATA,
        Sections(3),
        Sections::POSTDATA,
        Sections(5),
        Sections(6),
        Sections::ALL,
    ];

    #[test]
    fn test_contains_matches_superset_relation() {
        for a in LATTICE {
            for b in LATTICE {
                assert_eq!(
                    a.contains(b),
                    a.bits() & b.bits() == b.bits(),
                    "contains({a:?}, {b:?})"
                );
            }
        }
        // Every set contains the empty set.
        for a in LATTICE {
            assert!(a.contains(Sections::EMPTY));
        }
    }

    #[test]
    fn test_set_and_clear() {
        let mut s = Sections::new();
        s.set(Sections::PREDATA);
        s.set(Sections::DATA);
        assert!(s.is(Sections::PREDATA | Sections::DATA));
        s.clear(Sections::DATA);
        assert!(s.is(Sections::PREDATA));
        s.clear(Sections::PREDATA);
        assert!(s.is(Sections::EMPTY));
    }

    #[test]
    fn test_display_canonical_order() {
        assert_eq!(Sections::ALL.to_string(), "predata, data, postdata");
        assert_eq!(
            (Sections::DATA | Sections::POSTDATA).to_string(),
            "data, postdata"
        );
        assert_eq!(Sections::EMPTY.to_string(), "");
    }

    #[test]
    fn test_from_tokens_roundtrips_canonical_forms() {
        for want in LATTICE {
            let tokens: Vec<String> = want
                .to_string()
                .split(", ")
                .map(|s| s.to_string())
                .collect();
            let mut got = Sections::new();
            got.from_tokens(tokens).unwrap();
            assert_eq!(got, want);
        }
    }

    #[test]
    fn test_from_tokens_is_forgiving_about_formatting() {
        let mut s = Sections::new();
        s.from_tokens(["Pre-Data", " post data ", "=data"]).unwrap();
        assert!(s.is(Sections::ALL));
    }

    #[test]
    fn test_from_tokens_rejects_unknown_and_empty() {
        let mut s = Sections::new();
        assert_eq!(
            s.from_tokens(["invalid"]).unwrap_err().to_string(),
            "Unrecognized section name: invalid"
        );
        let mut s = Sections::new();
        assert_eq!(
            s.from_tokens([""]).unwrap_err().to_string(),
            "No sections provided"
        );
    }

    // ── set_backup ──────────────────────────────────────────────────────

    #[test]
    fn test_set_backup_defaults_to_all_sections() {
        let mut s = Sections::new();
        s.set_backup(&BackupFlags::default()).unwrap();
        assert!(s.is(Sections::ALL));
        assert_eq!(s.to_string(), "predata, data, postdata");
    }

    #[test]
    fn test_set_backup_single_sections() {
        for (names, want) in [
            (&["predata"][..], Sections::PREDATA),
            (&["data"], Sections::DATA),
            (&["postdata"], Sections::POSTDATA),
        ] {
            let mut s = Sections::new();
            s.set_backup(&BackupFlags {
                sections: section_flags(names),
                ..BackupFlags::default()
            })
            .unwrap();
            assert!(s.is(want));
        }
    }

    #[test]
    fn test_set_backup_metadata_only_compatibility() {
        let mut s = Sections::new();
        s.set_backup(&BackupFlags {
            metadata_only: true,
            ..BackupFlags::default()
        })
        .unwrap();
        assert!(s.is(Sections::PREDATA | Sections::POSTDATA));

        let mut s = Sections::new();
        s.set_backup(&BackupFlags {
            data_only: true,
            ..BackupFlags::default()
        })
        .unwrap();
        assert!(s.is(Sections::DATA));
    }

    #[test]
    fn test_set_backup_rejects_empty_and_invalid_section_flags() {
        let mut s = Sections::new();
        let err = s
            .set_backup(&BackupFlags {
                sections: Some(vec![]),
                ..BackupFlags::default()
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "No section flags provided");

        let mut s = Sections::new();
        let err = s
            .set_backup(&BackupFlags {
                sections: section_flags(&["invalid"]),
                ..BackupFlags::default()
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "Unrecognized section name: invalid");
    }

    #[test]
    fn test_set_backup_exclusive_flags_require_data() {
        let mut s = Sections::new();
        let err = s
            .set_backup(&BackupFlags {
                sections: section_flags(&["predata"]),
                incremental: true,
                ..BackupFlags::default()
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot use --incremental without section: data");

        let mut s = Sections::new();
        let err = s
            .set_backup(&BackupFlags {
                sections: section_flags(&["predata"]),
                leaf_partition_data: true,
                ..BackupFlags::default()
            })
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot use --leaf-partition-data without section: data"
        );
    }

    #[test]
    fn test_set_backup_incremental_allowed_with_data() {
        let mut s = Sections::new();
        s.set_backup(&BackupFlags {
            incremental: true,
            ..BackupFlags::default()
        })
        .unwrap();
        assert!(s.is(Sections::ALL));
    }

    // ── set_restore ─────────────────────────────────────────────────────

    #[test]
    fn test_set_restore_requires_a_config() {
        let mut s = Sections::new();
        let err = s.set_restore(&RestoreFlags::default(), None).unwrap_err();
        assert_eq!(err.to_string(), "Empty backup config");
    }

    #[test]
    fn test_set_restore_nothing_requested_nothing_recorded() {
        let mut s = Sections::new();
        s.set_restore(&RestoreFlags::default(), Some(&config_with(Sections::EMPTY)))
            .unwrap();
        assert!(s.is(Sections::ALL));
    }

    #[test]
    fn test_set_restore_nothing_requested_takes_recorded_sections() {
        let mut s = Sections::new();
        s.set_restore(
            &RestoreFlags::default(),
            Some(&config_with(Sections::PREDATA | Sections::DATA)),
        )
        .unwrap();
        assert!(s.is(Sections::PREDATA | Sections::DATA));
    }

    #[test]
    fn test_set_restore_exclusive_flags_require_predata() {
        let mut s = Sections::new();
        let err = s
            .set_restore(
                &RestoreFlags {
                    sections: section_flags(&["data"]),
                    create_db: true,
                    ..RestoreFlags::default()
                },
                Some(&config_with(Sections::ALL)),
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot use --create-db without section: predata");

        let mut s = Sections::new();
        let err = s
            .set_restore(
                &RestoreFlags {
                    sections: section_flags(&["data"]),
                    with_globals: true,
                    ..RestoreFlags::default()
                },
                Some(&config_with(Sections::ALL)),
            )
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot use --with-globals without section: predata"
        );
    }

    #[test]
    fn test_set_restore_admission_lattice() {
        // For every (requested, recorded) pair of non-empty section sets,
        // admission succeeds iff the recorded set is a superset.
        for requested in LATTICE {
            for recorded in LATTICE {
                let mut s = Sections::new();
                let flags = RestoreFlags {
                    sections: Some(
                        requested
                            .to_string()
                            .split(", ")
                            .map(|t| t.to_string())
                            .collect(),
                    ),
                    ..RestoreFlags::default()
                };
                let result = s.set_restore(&flags, Some(&config_with(recorded)));
                if recorded.contains(requested) {
                    assert!(
                        result.is_ok(),
                        "[{requested}] from [{recorded}] should be admissible"
                    );
                    assert!(s.is(requested));
                } else {
                    assert_eq!(
                        result.unwrap_err().to_string(),
                        format!(
                            "Cannot restore: [{requested}] from backup containing: [{recorded}]"
                        )
                    );
                }
            }
        }
    }

    #[test]
    fn test_set_restore_error_message_shape() {
        let mut s = Sections::new();
        let err = s
            .set_restore(
                &RestoreFlags {
                    sections: section_flags(&["data"]),
                    ..RestoreFlags::default()
                },
                Some(&config_with(Sections::PREDATA | Sections::POSTDATA)),
            )
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot restore: [data] from backup containing: [predata, postdata]"
        );
    }

    #[test]
    fn test_set_restore_from_pre_sections_backup_without_legacy_flags() {
        // A backup recorded before the sections feature restricts nothing.
        let mut s = Sections::new();
        s.set_restore(
            &RestoreFlags {
                sections: section_flags(&["data"]),
                ..RestoreFlags::default()
            },
            Some(&config_with(Sections::EMPTY)),
        )
        .unwrap();
        assert!(s.is(Sections::DATA));
    }

    #[test]
    fn test_set_restore_normalizes_legacy_metadata_only_backup() {
        let config = BackupConfig {
            metadata_only: true,
            ..BackupConfig::default()
        };
        // [postdata] is inside the normalized predata|postdata set.
        let mut s = Sections::new();
        s.set_restore(
            &RestoreFlags {
                sections: section_flags(&["postdata"]),
                ..RestoreFlags::default()
            },
            Some(&config),
        )
        .unwrap();
        assert!(s.is(Sections::POSTDATA));

        // [data] is not.
        let mut s = Sections::new();
        let err = s
            .set_restore(
                &RestoreFlags {
                    sections: section_flags(&["data"]),
                    ..RestoreFlags::default()
                },
                Some(&config),
            )
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot restore: [data] from backup containing: [predata, postdata]"
        );
    }

    #[test]
    fn test_set_restore_normalizes_legacy_data_only_backup() {
        let config = BackupConfig {
            data_only: true,
            ..BackupConfig::default()
        };
        let mut s = Sections::new();
        s.set_restore(&RestoreFlags::default(), Some(&config)).unwrap();
        assert!(s.is(Sections::DATA));
    }

    #[test]
    fn test_set_restore_metadata_only_request() {
        let mut s = Sections::new();
        s.set_restore(
            &RestoreFlags {
                metadata_only: true,
                ..RestoreFlags::default()
            },
            Some(&config_with(Sections::ALL)),
        )
        .unwrap();
        assert!(s.is(Sections::PREDATA | Sections::POSTDATA));
    }
}
