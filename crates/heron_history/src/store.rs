//! Embedded backup-history store.
//!
//! A single-file SQLite database records one `backups` row per completed
//! backup plus normalized child tables for the include/exclude lists and
//! the restore plan. The store performs no retries and does not support
//! concurrent writers on the same file; database errors surface to the
//! caller unchanged.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::config::{BackupConfig, RestorePlanEntry};
use crate::error::{HistoryError, HistoryResult};
use crate::section::Sections;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS backups (
    timestamp TEXT NOT NULL PRIMARY KEY,
    database_name TEXT NOT NULL,
    sections INTEGER NOT NULL DEFAULT 0,
    metadata_only INTEGER NOT NULL DEFAULT 0,
    data_only INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS include_relations (
    timestamp TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    name TEXT NOT NULL,
    PRIMARY KEY (timestamp, ordinal)
);
CREATE TABLE IF NOT EXISTS exclude_relations (
    timestamp TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    name TEXT NOT NULL,
    PRIMARY KEY (timestamp, ordinal)
);
CREATE TABLE IF NOT EXISTS include_schemas (
    timestamp TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    name TEXT NOT NULL,
    PRIMARY KEY (timestamp, ordinal)
);
CREATE TABLE IF NOT EXISTS exclude_schemas (
    timestamp TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    name TEXT NOT NULL,
    PRIMARY KEY (timestamp, ordinal)
);
CREATE TABLE IF NOT EXISTS restore_plans (
    timestamp TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    plan_timestamp TEXT NOT NULL,
    PRIMARY KEY (timestamp, ordinal)
);
CREATE TABLE IF NOT EXISTS restore_plan_tables (
    timestamp TEXT NOT NULL,
    plan_ordinal INTEGER NOT NULL,
    ordinal INTEGER NOT NULL,
    name TEXT NOT NULL,
    PRIMARY KEY (timestamp, plan_ordinal, ordinal)
);
";

/// Handle to the backup history database.
pub struct HistoryStore {
    conn: Connection,
}

impl HistoryStore {
    /// Open or create the history database at `path` and ensure the
    /// schema exists. Idempotent.
    pub fn initialize(path: &Path) -> HistoryResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "initialized backup history database");
        Ok(Self { conn })
    }

    /// Record one completed backup. The timestamp is the primary key; a
    /// duplicate insert fails with the database's uniqueness violation,
    /// surfaced verbatim.
    pub fn store(&mut self, config: &BackupConfig) -> HistoryResult<()> {
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO backups (timestamp, database_name, sections, metadata_only, data_only)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                config.timestamp,
                config.database_name,
                config.sections.bits(),
                config.metadata_only,
                config.data_only,
            ],
        )?;

        for (table, names) in [
            ("include_relations", &config.include_relations),
            ("exclude_relations", &config.exclude_relations),
            ("include_schemas", &config.include_schemas),
            ("exclude_schemas", &config.exclude_schemas),
        ] {
            let sql = format!(
                "INSERT INTO {} (timestamp, ordinal, name) VALUES (?1, ?2, ?3)",
                table
            );
            let mut stmt = tx.prepare(&sql)?;
            for (ordinal, name) in names.iter().enumerate() {
                stmt.execute(params![config.timestamp, ordinal as i64, name])?;
            }
        }

        {
            let mut plan_stmt = tx.prepare(
                "INSERT INTO restore_plans (timestamp, ordinal, plan_timestamp)
                 VALUES (?1, ?2, ?3)",
            )?;
            let mut table_stmt = tx.prepare(
                "INSERT INTO restore_plan_tables (timestamp, plan_ordinal, ordinal, name)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (plan_ordinal, entry) in config.restore_plan.iter().enumerate() {
                plan_stmt.execute(params![
                    config.timestamp,
                    plan_ordinal as i64,
                    entry.timestamp
                ])?;
                for (ordinal, name) in entry.table_fqns.iter().enumerate() {
                    table_stmt.execute(params![
                        config.timestamp,
                        plan_ordinal as i64,
                        ordinal as i64,
                        name
                    ])?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Reassemble the full config for one timestamp.
    pub fn get(&self, timestamp: &str) -> HistoryResult<BackupConfig> {
        let row = self
            .conn
            .query_row(
                "SELECT database_name, sections, metadata_only, data_only
                 FROM backups WHERE timestamp = ?1",
                params![timestamp],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, bool>(3)?,
                    ))
                },
            )
            .optional()?;

        let (database_name, sections, metadata_only, data_only) =
            row.ok_or(HistoryError::TimestampNotFound)?;

        let mut config = BackupConfig {
            timestamp: timestamp.to_string(),
            database_name,
            sections: Sections::from_bits(sections),
            metadata_only,
            data_only,
            ..BackupConfig::default()
        };
        config.include_relations = self.child_names("include_relations", timestamp)?;
        config.exclude_relations = self.child_names("exclude_relations", timestamp)?;
        config.include_schemas = self.child_names("include_schemas", timestamp)?;
        config.exclude_schemas = self.child_names("exclude_schemas", timestamp)?;
        config.restore_plan = self.restore_plan(timestamp)?;
        Ok(config)
    }

    /// Access the underlying connection, for reporting queries.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn child_names(&self, table: &str, timestamp: &str) -> HistoryResult<Vec<String>> {
        let sql = format!(
            "SELECT name FROM {} WHERE timestamp = ?1 ORDER BY ordinal",
            table
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let names = stmt
            .query_map(params![timestamp], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn restore_plan(&self, timestamp: &str) -> HistoryResult<Vec<RestorePlanEntry>> {
        let mut plan_stmt = self.conn.prepare(
            "SELECT ordinal, plan_timestamp FROM restore_plans
             WHERE timestamp = ?1 ORDER BY ordinal",
        )?;
        let mut table_stmt = self.conn.prepare(
            "SELECT name FROM restore_plan_tables
             WHERE timestamp = ?1 AND plan_ordinal = ?2 ORDER BY ordinal",
        )?;

        let plans = plan_stmt
            .query_map(params![timestamp], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(plans.len());
        for (plan_ordinal, plan_timestamp) in plans {
            let table_fqns = table_stmt
                .query_map(params![timestamp, plan_ordinal], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            entries.push(RestorePlanEntry {
                timestamp: plan_timestamp,
                table_fqns,
            });
        }
        Ok(entries)
    }
}
