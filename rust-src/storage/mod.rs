//! Storage layer for historical usage data.
//!
//! One capability trait, [`SnapshotStore`], with a SQLite and a DuckDB
//! implementation. [`open_store`] picks the engine from configuration.

mod fingerprint;
mod pricing;
mod rows;
mod schema;
mod sqlite;
mod stats;

#[cfg(feature = "duckdb")]
mod duckdb;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};

use crate::aggregation::backfill_daily_limits;
use crate::config::{DeviceIdentity, StorageConfig, StorageFormat, StorageMode};
#[cfg(not(feature = "duckdb"))]
use crate::error::StorageError;
use crate::models::{
    DailyLimits, DailySnapshot, FileFingerprint, LimitsReading, LimitsSnapshot, UsageRecord,
};
use crate::replica::ReplicaReport;

pub use fingerprint::{classify, path_key, FileStat, StaleReport, TrackedFile};
pub use pricing::{PriceList, BUILTIN_PRICING};
pub use schema::{ImportOutcome, Table, TableRow, DEVICE_COLUMNS, SYNC_DEVICE_COLUMN};
pub use sqlite::SqliteStore;
pub use stats::{DatabaseStats, LedgerTotals, ModelUsage, StatsInputs};

#[cfg(feature = "duckdb")]
pub use self::duckdb::DuckDbStore;


/// Operations every storage engine provides.
///
/// Engines implement the primitive reads and writes; staleness checks,
/// limits backfill and cost math are shared default methods.
pub trait SnapshotStore {
    fn format(&self) -> StorageFormat;

    fn path(&self) -> &Path;

    /// Persist a batch of records and update the daily ledger.
    ///
    /// Full mode inserts unseen records and recomputes every date that has
    /// raw rows; aggregate mode adds the batch's per-day totals onto the
    /// ledger and must only ever see each record once. Returns new records
    /// (full) or touched dates (aggregate).
    fn save(
        &self,
        records: &[UsageRecord],
        mode: StorageMode,
        device: Option<&DeviceIdentity>,
    ) -> Result<usize>;

    /// Raw records in an inclusive `YYYY-MM-DD` range, oldest first.
    fn load_records(&self, start_date: Option<&str>, end_date: Option<&str>) -> Result<Vec<UsageRecord>>;

    /// Ledger rows in an inclusive `YYYY-MM-DD` range, oldest first.
    fn daily_snapshots(&self, start_date: Option<&str>, end_date: Option<&str>) -> Result<Vec<DailySnapshot>>;

    fn record_limits_at(
        &self,
        reading: &LimitsReading,
        device: Option<&DeviceIdentity>,
        observed_at: DateTime<Local>,
    ) -> Result<()>;

    /// Record a limits reading observed now.
    fn record_limits(&self, reading: &LimitsReading, device: Option<&DeviceIdentity>) -> Result<()> {
        self.record_limits_at(reading, device, Local::now())
    }

    /// Maximum week and opus percentages per observed date.
    fn daily_limit_maxima(&self) -> Result<BTreeMap<String, DailyLimits>>;

    /// One entry per date between the first and last reading, gaps backfilled.
    fn daily_series(&self) -> Result<BTreeMap<String, DailyLimits>> {
        Ok(backfill_daily_limits(&self.daily_limit_maxima()?))
    }

    fn latest_limits(&self) -> Result<Option<LimitsSnapshot>>;

    fn stats_inputs(&self) -> Result<StatsInputs>;

    fn stats(&self) -> Result<DatabaseStats> {
        Ok(DatabaseStats::from_inputs(self.stats_inputs()?))
    }

    fn stored_fingerprints(&self) -> Result<HashMap<String, TrackedFile>>;

    fn put_fingerprint(&self, fingerprint: &FileFingerprint) -> Result<()>;

    /// Delete fingerprints for paths confirmed gone; returns rows removed.
    fn remove_fingerprints(&self, paths: &[String]) -> Result<usize>;

    fn fingerprint_count(&self) -> Result<i64>;

    fn stale_files(&self, candidates: &[PathBuf]) -> Result<StaleReport> {
        Ok(classify(candidates, &self.stored_fingerprints()?))
    }

    /// Remember a successfully parsed file's current mtime and size.
    fn commit_fingerprint(&self, path: &Path, record_count: i64) -> Result<()> {
        let stat = FileStat::read(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?;

        self.put_fingerprint(&FileFingerprint {
            file_path: path_key(path),
            mtime_ns: stat.mtime_ns,
            size_bytes: stat.size_bytes,
            record_count,
            last_parsed: Local::now().to_rfc3339(),
        })
    }

    /// All rows of `table`, or `None` when the table does not exist.
    fn export_table(&self, table: Table) -> Result<Option<Vec<TableRow>>>;

    /// Write migrated rows; per-row failures are collected, not raised.
    fn import_rows(&self, rows: &[TableRow]) -> Result<ImportOutcome>;

    /// Add missing device columns and tag untagged rows with `device`.
    fn add_device_columns(&self, device: &DeviceIdentity) -> Result<usize>;

    fn has_device_columns(&self) -> Result<bool>;

    /// Replace this device's rows in a replica file with the local rows.
    fn push_replica(&self, replica_path: &Path, device_id: &str) -> Result<ReplicaReport>;

    /// Device ids present in this database when used as a replica.
    fn replica_devices(&self) -> Result<Vec<String>>;
}


/// Open (and initialize) the configured database.
pub fn open_store(config: &StorageConfig) -> Result<Box<dyn SnapshotStore>> {
    open_store_at(&config.db_path(), config.storage_format, &config.price_list())
}


/// Open (and initialize) a database of `format` at an explicit path.
pub fn open_store_at(path: &Path, format: StorageFormat, pricing: &PriceList) -> Result<Box<dyn SnapshotStore>> {
    match format {
        StorageFormat::Sqlite => Ok(Box::new(SqliteStore::open_with_pricing(path, pricing)?)),
        StorageFormat::DuckDb => open_duckdb(path, pricing),
    }
}


/// Open an existing database without creating or altering anything.
pub fn open_existing_store(path: &Path, format: StorageFormat) -> Result<Box<dyn SnapshotStore>> {
    match format {
        StorageFormat::Sqlite => Ok(Box::new(SqliteStore::open_existing(path)?)),
        StorageFormat::DuckDb => open_existing_duckdb(path),
    }
}


/// Whether the DuckDB engine is compiled into this build.
pub fn duckdb_available() -> bool {
    cfg!(feature = "duckdb")
}


#[cfg(feature = "duckdb")]
fn open_duckdb(path: &Path, pricing: &PriceList) -> Result<Box<dyn SnapshotStore>> {
    Ok(Box::new(DuckDbStore::open_with_pricing(path, pricing)?))
}

#[cfg(not(feature = "duckdb"))]
fn open_duckdb(_path: &Path, _pricing: &PriceList) -> Result<Box<dyn SnapshotStore>> {
    Err(StorageError::EngineUnavailable { engine: "duckdb" }.into())
}

#[cfg(feature = "duckdb")]
fn open_existing_duckdb(path: &Path) -> Result<Box<dyn SnapshotStore>> {
    Ok(Box::new(DuckDbStore::open_existing(path)?))
}

#[cfg(not(feature = "duckdb"))]
fn open_existing_duckdb(_path: &Path) -> Result<Box<dyn SnapshotStore>> {
    Err(StorageError::EngineUnavailable { engine: "duckdb" }.into())
}


/// Create the parent directory of a database file.
fn ensure_parent_dir(db_path: &Path) -> Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }
    Ok(())
}
