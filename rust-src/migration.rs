//! Moving history between engines and evolving older schemas.
//!
//! Copies run table by table. A table that fails to export or import is
//! reported and skipped; the others still copy.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{DeviceIdentity, StorageFormat};
use crate::error::StorageError;
use crate::storage::{
    duckdb_available, open_existing_store, open_store_at, PriceList, SnapshotStore, Table, TableRow,
};


/// Rows written per table and every error collected on the way.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub counts: BTreeMap<String, usize>,
    pub errors: Vec<String>,
}

impl MigrationReport {
    pub fn count(&self, table: Table) -> usize {
        self.counts.get(table.name()).copied().unwrap_or(0)
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}


/// State of one database file as seen before migrating.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseStatus {
    pub exists: bool,
    pub has_device_columns: bool,
    pub record_count: usize,
    pub error: Option<String>,
}


#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub sqlite: DatabaseStatus,
    pub duckdb: DatabaseStatus,
}


/// Copy every table from `source` into `dest`.
///
/// Raw records already present in `dest` are left alone; keyed tables are
/// overwritten by key. Rows without device values take them from
/// `device_override`, rows that have them keep them. Running the same copy
/// twice leaves `dest` unchanged.
pub fn copy(
    source: &dyn SnapshotStore,
    dest: &dyn SnapshotStore,
    device_override: Option<&DeviceIdentity>,
) -> MigrationReport {
    let mut report = MigrationReport::default();

    for table in Table::ALL {
        let rows = match source.export_table(table) {
            Ok(Some(rows)) => rows,
            Ok(None) => {
                debug!(table = %table, "Source table missing, skipping");
                continue;
            }
            Err(e) => {
                warn!(table = %table, error = %e, "Failed to read table");
                report.errors.push(format!("{table}: {e:#}"));
                continue;
            }
        };

        let rows: Vec<TableRow> = rows
            .into_iter()
            .map(|row| apply_device(row, device_override))
            .collect();

        match dest.import_rows(&rows) {
            Ok(outcome) => {
                if !outcome.errors.is_empty() {
                    warn!(table = %table, failed = outcome.errors.len(), "Some rows failed to copy");
                }
                report.counts.insert(table.name().to_string(), outcome.written);
                report.errors.extend(outcome.errors);
            }
            Err(e) => {
                warn!(table = %table, error = %e, "Failed to write table");
                report.errors.push(format!("{table}: {e:#}"));
            }
        }
    }

    report
}


fn apply_device(row: TableRow, device_override: Option<&DeviceIdentity>) -> TableRow {
    match row {
        TableRow::Daily(mut s) => {
            s.device = s.device.or_identity(device_override);
            TableRow::Daily(s)
        }
        TableRow::Record(mut r) => {
            r.device = r.device.or_identity(device_override);
            TableRow::Record(r)
        }
        TableRow::Limits(mut l) => {
            l.device = l.device.or_identity(device_override);
            TableRow::Limits(l)
        }
        other => other,
    }
}


/// Copy a SQLite database into a (possibly new) DuckDB database.
pub fn migrate_sqlite_to_duckdb(
    sqlite_path: &Path,
    duckdb_path: &Path,
    device: Option<&DeviceIdentity>,
) -> Result<MigrationReport> {
    migrate(
        (sqlite_path, StorageFormat::Sqlite),
        (duckdb_path, StorageFormat::DuckDb),
        device,
    )
}


/// Copy a DuckDB database into a (possibly new) SQLite database.
pub fn migrate_duckdb_to_sqlite(
    duckdb_path: &Path,
    sqlite_path: &Path,
    device: Option<&DeviceIdentity>,
) -> Result<MigrationReport> {
    migrate(
        (duckdb_path, StorageFormat::DuckDb),
        (sqlite_path, StorageFormat::Sqlite),
        device,
    )
}


fn migrate(
    (source_path, source_format): (&Path, StorageFormat),
    (dest_path, dest_format): (&Path, StorageFormat),
    device: Option<&DeviceIdentity>,
) -> Result<MigrationReport> {
    if !duckdb_available() {
        return Err(StorageError::EngineUnavailable { engine: "duckdb" }.into());
    }

    let source = open_existing_store(source_path, source_format)?;
    let dest = open_store_at(dest_path, dest_format, &PriceList::builtin())?;

    // Only an explicit override retags rows already in the destination
    if let Some(device) = device {
        dest.add_device_columns(device)?;
    }

    let report = copy(source.as_ref(), dest.as_ref(), device);

    info!(
        source = %source_path.display(),
        dest = %dest_path.display(),
        counts = ?report.counts,
        errors = report.errors.len(),
        "Migration complete"
    );
    Ok(report)
}


/// Add missing device columns to an existing database and tag untagged rows.
///
/// Returns the number of rows tagged, or 0 if the file does not exist.
pub fn add_device_columns(db_path: &Path, format: StorageFormat, device: &DeviceIdentity) -> Result<usize> {
    if format == StorageFormat::DuckDb && !duckdb_available() {
        return Err(StorageError::EngineUnavailable { engine: "duckdb" }.into());
    }
    if !db_path.exists() {
        return Ok(0);
    }

    let updated = open_existing_store(db_path, format)?.add_device_columns(device)?;
    info!(path = %db_path.display(), updated, "Device columns ensured");
    Ok(updated)
}


/// Whether every device-bearing table in an existing database has all device columns.
pub fn has_device_columns(db_path: &Path, format: StorageFormat) -> Result<bool> {
    if !db_path.exists() {
        return Ok(false);
    }
    open_existing_store(db_path, format)?.has_device_columns()
}


/// Inspect both candidate files of a migration.
pub fn migration_status(sqlite_path: &Path, duckdb_path: &Path) -> MigrationStatus {
    MigrationStatus {
        sqlite: inspect(sqlite_path, StorageFormat::Sqlite),
        duckdb: inspect(duckdb_path, StorageFormat::DuckDb),
    }
}


fn inspect(db_path: &Path, format: StorageFormat) -> DatabaseStatus {
    let mut status = DatabaseStatus {
        exists: db_path.exists(),
        ..Default::default()
    };
    if !status.exists {
        return status;
    }

    let result = open_existing_store(db_path, format).and_then(|store| {
        let has_device_columns = store.has_device_columns()?;
        let record_count = store.daily_snapshots(None, None)?.len();
        Ok((has_device_columns, record_count))
    });

    match result {
        Ok((has_device_columns, record_count)) => {
            status.has_device_columns = has_device_columns;
            status.record_count = record_count;
        }
        Err(e) => {
            warn!(path = %db_path.display(), engine = %format, error = %e, "Error checking database status");
            status.error = Some(format!("{e:#}"));
        }
    }

    status
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DailySnapshot, DeviceTag};

    #[test]
    fn test_apply_device_fills_only_missing() {
        let device = DeviceIdentity::new("desk", "Desk", "linux");
        let tagged = TableRow::Daily(DailySnapshot {
            date: "2025-03-01".to_string(),
            device: DeviceTag {
                device_id: Some("laptop".to_string()),
                device_name: None,
                device_type: None,
            },
            ..Default::default()
        });

        let TableRow::Daily(snapshot) = apply_device(tagged, Some(&device)) else {
            panic!("row kind changed");
        };
        assert_eq!(snapshot.device.device_id.as_deref(), Some("laptop"));
        assert_eq!(snapshot.device.device_name.as_deref(), Some("Desk"));
    }

    #[test]
    fn test_status_of_missing_files() {
        let tmp_dir = tempfile::TempDir::new().unwrap();
        let status = migration_status(
            &tmp_dir.path().join("usage_history.db"),
            &tmp_dir.path().join("usage_history.duckdb"),
        );

        assert!(!status.sqlite.exists);
        assert!(!status.duckdb.exists);
        assert_eq!(status.sqlite.record_count, 0);
        assert!(status.duckdb.error.is_none());
    }
}
