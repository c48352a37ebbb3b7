//! DuckDB storage engine.
//!
//! Mirrors the SQLite engine table for table. DuckDB differs in a few ways
//! that shape this file:
//! - `SUM` over BIGINT yields HUGEINT, so aggregates are cast back.
//! - Surrogate ids come from a sequence rather than AUTOINCREMENT.
//! - A failed statement aborts the enclosing transaction, so inserts that
//!   may collide are preceded by existence checks.
//! - Columns cannot be added to a table while an index depends on it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use ::duckdb::{params, params_from_iter, Connection};
use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use tracing::{debug, info, warn};

use crate::aggregation::aggregate_by_day;
use crate::config::{DeviceIdentity, StorageFormat, StorageMode};
use crate::error::StorageError;
use crate::models::{
    DailyLimits, DailySnapshot, DeviceTag, FileFingerprint, LimitsReading, LimitsSnapshot,
    StoredRecord, UsageRecord,
};
use crate::replica::{self, ReplicaReport};
use crate::storage::rows::{
    daily_snapshot_from_row, fingerprint_from_row, limits_snapshot_from_row, pricing_from_row,
    stored_record_from_row,
};
use crate::storage::schema::{
    date_filter, export_query, select_list, ImportOutcome, Table, TableRow, DEVICE_COLUMNS,
    SYNC_DEVICE_COLUMN,
};
use crate::storage::{
    ensure_parent_dir, FileStat, LedgerTotals, ModelUsage, PriceList, SnapshotStore, StatsInputs,
    TrackedFile,
};


const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS daily_snapshots (
        date VARCHAR PRIMARY KEY,
        total_prompts BIGINT NOT NULL,
        total_responses BIGINT NOT NULL,
        total_sessions BIGINT NOT NULL,
        total_tokens BIGINT NOT NULL,
        input_tokens BIGINT NOT NULL,
        output_tokens BIGINT NOT NULL,
        cache_creation_tokens BIGINT NOT NULL,
        cache_read_tokens BIGINT NOT NULL,
        snapshot_timestamp VARCHAR NOT NULL,
        device_id VARCHAR,
        device_name VARCHAR,
        device_type VARCHAR
    );

    CREATE SEQUENCE IF NOT EXISTS usage_records_id_seq START 1;

    CREATE TABLE IF NOT EXISTS usage_records (
        id BIGINT PRIMARY KEY DEFAULT nextval('usage_records_id_seq'),
        date VARCHAR NOT NULL,
        timestamp VARCHAR NOT NULL,
        session_id VARCHAR NOT NULL,
        message_uuid VARCHAR NOT NULL,
        message_type VARCHAR NOT NULL,
        model VARCHAR,
        folder VARCHAR NOT NULL,
        git_branch VARCHAR,
        version VARCHAR NOT NULL,
        input_tokens BIGINT NOT NULL,
        output_tokens BIGINT NOT NULL,
        cache_creation_tokens BIGINT NOT NULL,
        cache_read_tokens BIGINT NOT NULL,
        total_tokens BIGINT NOT NULL,
        device_id VARCHAR,
        device_name VARCHAR,
        device_type VARCHAR,
        UNIQUE(session_id, message_uuid)
    );

    CREATE TABLE IF NOT EXISTS limits_snapshots (
        timestamp VARCHAR PRIMARY KEY,
        date VARCHAR NOT NULL,
        session_pct BIGINT,
        week_pct BIGINT,
        opus_pct BIGINT,
        session_reset VARCHAR,
        week_reset VARCHAR,
        opus_reset VARCHAR,
        device_id VARCHAR,
        device_name VARCHAR,
        device_type VARCHAR
    );

    CREATE TABLE IF NOT EXISTS file_metadata (
        file_path VARCHAR PRIMARY KEY,
        mtime_ns BIGINT NOT NULL,
        size_bytes BIGINT NOT NULL,
        record_count BIGINT NOT NULL,
        last_parsed VARCHAR NOT NULL
    );

    CREATE TABLE IF NOT EXISTS model_pricing (
        model_name VARCHAR PRIMARY KEY,
        input_price_per_mtok DOUBLE NOT NULL,
        output_price_per_mtok DOUBLE NOT NULL,
        cache_write_price_per_mtok DOUBLE NOT NULL,
        cache_read_price_per_mtok DOUBLE NOT NULL,
        last_updated VARCHAR NOT NULL,
        notes VARCHAR
    );
";

const INDEXES: &str = "
    CREATE INDEX IF NOT EXISTS idx_usage_records_date ON usage_records(date);
    CREATE INDEX IF NOT EXISTS idx_limits_snapshots_date ON limits_snapshots(date);
";

const INSERT_RECORD: &str = "
    INSERT INTO usage_records (
        date, timestamp, session_id, message_uuid, message_type,
        model, folder, git_branch, version,
        input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens, total_tokens,
        device_id, device_name, device_type
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const UPSERT_DAILY: &str = "
    INSERT OR REPLACE INTO daily_snapshots (
        date, total_prompts, total_responses, total_sessions, total_tokens,
        input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens,
        snapshot_timestamp, device_id, device_name, device_type
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const INSERT_LIMITS: &str = "
    INSERT INTO limits_snapshots (
        timestamp, date, session_pct, week_pct, opus_pct,
        session_reset, week_reset, opus_reset,
        device_id, device_name, device_type
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

// `date` is indexed, so existing readings are updated around it
const UPDATE_LIMITS: &str = "
    UPDATE limits_snapshots SET
        session_pct = ?, week_pct = ?, opus_pct = ?,
        session_reset = ?, week_reset = ?, opus_reset = ?,
        device_id = ?, device_name = ?, device_type = ?
    WHERE timestamp = ?";

const UPSERT_FINGERPRINT: &str = "
    INSERT OR REPLACE INTO file_metadata (
        file_path, mtime_ns, size_bytes, record_count, last_parsed
    ) VALUES (?, ?, ?, ?, ?)";

const UPSERT_PRICING: &str = "
    INSERT OR REPLACE INTO model_pricing (
        model_name, input_price_per_mtok, output_price_per_mtok,
        cache_write_price_per_mtok, cache_read_price_per_mtok,
        last_updated, notes
    ) VALUES (?, ?, ?, ?, ?, ?, ?)";


/// A DuckDB database file holding one device's history.
#[derive(Debug, Clone)]
pub struct DuckDbStore {
    path: PathBuf,
}


impl DuckDbStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        Self::open_with_pricing(db_path, &PriceList::builtin())
    }

    pub fn open_with_pricing(db_path: &Path, pricing: &PriceList) -> Result<Self> {
        let store = Self {
            path: db_path.to_path_buf(),
        };
        store.init(pricing)?;
        Ok(store)
    }

    /// Open a database that must already exist, leaving its schema untouched.
    pub fn open_existing(db_path: &Path) -> Result<Self> {
        if !db_path.exists() {
            return Err(StorageError::SourceMissing(db_path.to_path_buf()).into());
        }
        Ok(Self {
            path: db_path.to_path_buf(),
        })
    }

    fn connect(&self) -> Result<Connection> {
        Connection::open(&self.path)
            .with_context(|| format!("Failed to open database: {}", self.path.display()))
    }

    fn init(&self, pricing: &PriceList) -> Result<()> {
        ensure_parent_dir(&self.path)?;

        let mut conn = self.connect()?;
        conn.execute_batch(SCHEMA)?;

        for table in Table::WITH_DEVICE_COLUMNS {
            add_missing_device_columns(&conn, table)?;
        }
        conn.execute_batch(INDEXES)?;

        // Deleted keys cannot be re-inserted in the same transaction
        conn.execute("DELETE FROM model_pricing", [])?;

        let timestamp = Utc::now().to_rfc3339();
        let tx = conn.transaction()?;
        for price in pricing.prices() {
            tx.execute(
                UPSERT_PRICING,
                params![
                    price.model_name,
                    price.rates.input,
                    price.rates.output,
                    price.rates.cache_write,
                    price.rates.cache_read,
                    timestamp,
                    price.notes,
                ],
            )?;
        }
        tx.commit()?;

        Ok(())
    }
}


impl SnapshotStore for DuckDbStore {
    fn format(&self) -> StorageFormat {
        StorageFormat::DuckDb
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn save(
        &self,
        records: &[UsageRecord],
        mode: StorageMode,
        device: Option<&DeviceIdentity>,
    ) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let tag = DeviceTag::stamp(device);
        let timestamp = Local::now().to_rfc3339();
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;

        let saved_count = match mode {
            StorageMode::Full => {
                let inserted = insert_records(&tx, records, &tag)?;
                refresh_daily_from_records(&tx, &timestamp, &tag)?;
                inserted
            }
            StorageMode::Aggregate => merge_daily_totals(&tx, records, &timestamp, &tag)?,
        };

        tx.commit()?;
        Ok(saved_count)
    }

    fn load_records(&self, start_date: Option<&str>, end_date: Option<&str>) -> Result<Vec<UsageRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let conn = self.connect()?;
        let (filter, values) = date_filter(start_date, end_date);
        let query = format!(
            "SELECT {} FROM usage_records WHERE 1=1{filter} ORDER BY date, timestamp",
            Table::UsageRecords.columns().join(", ")
        );

        let mut stmt = conn.prepare(&query)?;
        let stored = stmt
            .query_map(params_from_iter(values.iter()), |row| Ok(stored_record_from_row!(row)))?
            .collect::<::duckdb::Result<Vec<StoredRecord>>>()?;

        Ok(stored
            .into_iter()
            .filter_map(|row| match row.into_record() {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable usage record");
                    None
                }
            })
            .collect())
    }

    fn daily_snapshots(&self, start_date: Option<&str>, end_date: Option<&str>) -> Result<Vec<DailySnapshot>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let conn = self.connect()?;
        let (filter, values) = date_filter(start_date, end_date);
        let query = format!(
            "SELECT {} FROM daily_snapshots WHERE 1=1{filter} ORDER BY date",
            Table::DailySnapshots.columns().join(", ")
        );

        let mut stmt = conn.prepare(&query)?;
        let snapshots = stmt
            .query_map(params_from_iter(values.iter()), |row| Ok(daily_snapshot_from_row!(row)))?
            .collect::<::duckdb::Result<Vec<_>>>()?;

        Ok(snapshots)
    }

    fn record_limits_at(
        &self,
        reading: &LimitsReading,
        device: Option<&DeviceIdentity>,
        observed_at: DateTime<Local>,
    ) -> Result<()> {
        let conn = self.connect()?;
        upsert_limits(
            &conn,
            &LimitsSnapshot {
                timestamp: observed_at.to_rfc3339(),
                date: observed_at.format("%Y-%m-%d").to_string(),
                reading: reading.clone(),
                device: DeviceTag::stamp(device),
            },
        )?;

        Ok(())
    }

    fn daily_limit_maxima(&self) -> Result<BTreeMap<String, DailyLimits>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT date, MAX(week_pct), MAX(opus_pct)
             FROM limits_snapshots
             GROUP BY date
             ORDER BY date",
        )?;

        let maxima = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    DailyLimits {
                        week_pct: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                        opus_pct: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    },
                ))
            })?
            .collect::<::duckdb::Result<BTreeMap<_, _>>>()?;

        Ok(maxima)
    }

    fn latest_limits(&self) -> Result<Option<LimitsSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let conn = self.connect()?;
        let query = format!(
            "SELECT {} FROM limits_snapshots ORDER BY timestamp DESC LIMIT 1",
            Table::LimitsSnapshots.columns().join(", ")
        );

        let latest = optional(conn.query_row(&query, [], |row| Ok(limits_snapshot_from_row!(row))))?;
        Ok(latest)
    }

    fn stats_inputs(&self) -> Result<StatsInputs> {
        if !self.path.exists() {
            return Ok(StatsInputs::default());
        }

        let conn = self.connect()?;

        let (total_records, total_days, oldest_date, newest_date): (i64, i64, Option<String>, Option<String>) =
            conn.query_row(
                "SELECT COUNT(*), COUNT(DISTINCT date), MIN(date), MAX(date) FROM usage_records",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

        let (newest_timestamp, ledger): (Option<String>, LedgerTotals) = conn.query_row(
            "SELECT MAX(snapshot_timestamp),
                    CAST(COALESCE(SUM(total_tokens), 0) AS BIGINT),
                    CAST(COALESCE(SUM(total_prompts), 0) AS BIGINT),
                    CAST(COALESCE(SUM(total_responses), 0) AS BIGINT),
                    CAST(COALESCE(SUM(total_sessions), 0) AS BIGINT)
             FROM daily_snapshots",
            [],
            |row| {
                Ok((
                    row.get(0)?,
                    LedgerTotals {
                        total_tokens: row.get(1)?,
                        total_prompts: row.get(2)?,
                        total_responses: row.get(3)?,
                        total_sessions: row.get(4)?,
                    },
                ))
            },
        )?;

        let models = if total_records > 0 {
            let mut stmt = conn.prepare(
                "SELECT ur.model,
                        CAST(SUM(ur.input_tokens) AS BIGINT),
                        CAST(SUM(ur.output_tokens) AS BIGINT),
                        CAST(SUM(ur.cache_creation_tokens) AS BIGINT),
                        CAST(SUM(ur.cache_read_tokens) AS BIGINT),
                        CAST(SUM(ur.total_tokens) AS BIGINT),
                        MAX(mp.input_price_per_mtok), MAX(mp.output_price_per_mtok),
                        MAX(mp.cache_write_price_per_mtok), MAX(mp.cache_read_price_per_mtok)
                 FROM usage_records ur
                 LEFT JOIN model_pricing mp ON ur.model = mp.model_name
                 WHERE ur.model IS NOT NULL
                 GROUP BY ur.model
                 ORDER BY SUM(ur.total_tokens) DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ModelUsage::from_sums(
                    row.get(0)?,
                    [row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?],
                    row.get(5)?,
                    [row.get(6)?, row.get(7)?, row.get(8)?, row.get(9)?],
                ))
            })?;
            rows.collect::<::duckdb::Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        Ok(StatsInputs {
            total_records,
            total_days,
            oldest_date,
            newest_date,
            newest_timestamp,
            ledger,
            models,
        })
    }

    fn stored_fingerprints(&self) -> Result<HashMap<String, TrackedFile>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let conn = self.connect()?;
        if table_columns(&conn, None, Table::FileMetadata)?.is_none() {
            return Ok(HashMap::new());
        }
        let mut stmt = conn.prepare(
            "SELECT file_path, mtime_ns, size_bytes, record_count FROM file_metadata",
        )?;

        let stored = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    TrackedFile {
                        stat: FileStat {
                            mtime_ns: row.get(1)?,
                            size_bytes: row.get(2)?,
                        },
                        record_count: row.get(3)?,
                    },
                ))
            })?
            .collect::<::duckdb::Result<HashMap<_, _>>>()?;

        Ok(stored)
    }

    fn put_fingerprint(&self, fingerprint: &FileFingerprint) -> Result<()> {
        let conn = self.connect()?;
        upsert_fingerprint(&conn, fingerprint)?;
        Ok(())
    }

    fn remove_fingerprints(&self, paths: &[String]) -> Result<usize> {
        if paths.is_empty() || !self.path.exists() {
            return Ok(0);
        }

        let conn = self.connect()?;
        let mut removed = 0;
        for path in paths {
            let present = optional(conn.query_row(
                "SELECT 1 FROM file_metadata WHERE file_path = ?",
                params![path],
                |_| Ok(()),
            ))?
            .is_some();
            if present {
                conn.execute("DELETE FROM file_metadata WHERE file_path = ?", params![path])?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    fn fingerprint_count(&self) -> Result<i64> {
        if !self.path.exists() {
            return Ok(0);
        }

        let conn = self.connect()?;
        if table_columns(&conn, None, Table::FileMetadata)?.is_none() {
            return Ok(0);
        }
        Ok(conn.query_row("SELECT COUNT(*) FROM file_metadata", [], |row| row.get(0))?)
    }

    fn export_table(&self, table: Table) -> Result<Option<Vec<TableRow>>> {
        let conn = self.connect()?;
        let Some(existing) = table_columns(&conn, None, table)? else {
            debug!(table = %table, "Table does not exist, skipping");
            return Ok(None);
        };

        let query = export_query(table, &existing, "VARCHAR");
        let mut stmt = conn.prepare(&query)?;

        let rows = match table {
            Table::DailySnapshots => stmt
                .query_map([], |row| Ok(TableRow::Daily(daily_snapshot_from_row!(row))))?
                .collect::<::duckdb::Result<Vec<_>>>()?,
            Table::UsageRecords => stmt
                .query_map([], |row| Ok(TableRow::Record(stored_record_from_row!(row))))?
                .collect::<::duckdb::Result<Vec<_>>>()?,
            Table::LimitsSnapshots => stmt
                .query_map([], |row| Ok(TableRow::Limits(limits_snapshot_from_row!(row))))?
                .collect::<::duckdb::Result<Vec<_>>>()?,
            Table::FileMetadata => stmt
                .query_map([], |row| Ok(TableRow::Fingerprint(fingerprint_from_row!(row))))?
                .collect::<::duckdb::Result<Vec<_>>>()?,
            Table::ModelPricing => stmt
                .query_map([], |row| Ok(TableRow::Pricing(pricing_from_row!(row))))?
                .collect::<::duckdb::Result<Vec<_>>>()?,
        };

        Ok(Some(rows))
    }

    fn import_rows(&self, rows: &[TableRow]) -> Result<ImportOutcome> {
        // No transaction: one bad row must not discard the others
        let conn = self.connect()?;
        let mut outcome = ImportOutcome::default();

        for row in rows {
            match import_row(&conn, row) {
                Ok(true) => outcome.written += 1,
                Ok(false) => debug!(table = %row.table(), "Skipping existing row"),
                Err(e) => outcome.errors.push(format!("{}: {e}", row.table())),
            }
        }

        Ok(outcome)
    }

    fn add_device_columns(&self, device: &DeviceIdentity) -> Result<usize> {
        let conn = self.connect()?;
        let mut updated = 0;

        for table in Table::WITH_DEVICE_COLUMNS {
            if !add_missing_device_columns(&conn, table)? {
                continue;
            }

            let untagged: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE device_id IS NULL"),
                [],
                |row| row.get(0),
            )?;
            if untagged == 0 {
                continue;
            }

            conn.execute(
                &format!(
                    "UPDATE {table}
                     SET device_id = ?, device_name = ?, device_type = ?
                     WHERE device_id IS NULL"
                ),
                params![device.id, device.name, device.device_type],
            )?;
            updated += usize::try_from(untagged).unwrap_or_default();
        }

        Ok(updated)
    }

    fn has_device_columns(&self) -> Result<bool> {
        let conn = self.connect()?;

        for table in Table::WITH_DEVICE_COLUMNS {
            if let Some(existing) = table_columns(&conn, None, table)? {
                if !DEVICE_COLUMNS.iter().all(|c| existing.contains(*c)) {
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    fn push_replica(&self, replica_path: &Path, device_id: &str) -> Result<ReplicaReport> {
        let device_id = replica::replica_device_id(device_id);
        ensure_parent_dir(replica_path)?;

        let conn = Connection::open(replica_path)
            .with_context(|| format!("Failed to open replica: {}", replica_path.display()))?;
        conn.execute_batch(&format!(
            "ATTACH '{}' AS local_db (READ_ONLY)",
            quote_path(&self.path)
        ))?;

        let mut report = ReplicaReport::new(&device_id);

        for table in Table::ALL {
            let Some(existing) = table_columns(&conn, Some("local_db"), table)? else {
                continue;
            };
            let select = select_list(table, &existing, "VARCHAR");
            let columns = table.columns().join(", ");

            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS main.{table} AS
                 SELECT {select}, CAST(NULL AS VARCHAR) AS {SYNC_DEVICE_COLUMN}
                 FROM local_db.{table} WHERE false"
            ))?;

            conn.execute(
                &format!("DELETE FROM main.{table} WHERE {SYNC_DEVICE_COLUMN} = ?"),
                params![device_id],
            )?;
            conn.execute(
                &format!(
                    "INSERT INTO main.{table} ({columns}, {SYNC_DEVICE_COLUMN})
                     SELECT {select}, CAST(? AS VARCHAR) FROM local_db.{table}"
                ),
                params![device_id],
            )?;

            let rows: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM main.{table} WHERE {SYNC_DEVICE_COLUMN} = ?"),
                params![device_id],
                |row| row.get(0),
            )?;
            report.record(table, rows);
        }

        conn.execute_batch("DETACH local_db")?;

        info!(
            replica = %replica_path.display(),
            device = %device_id,
            tables = report.tables.len(),
            "Pushed device rows to replica"
        );
        Ok(report)
    }

    fn replica_devices(&self) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut devices = BTreeSet::new();

        for table in Table::ALL {
            let Some(existing) = table_columns(&conn, None, table)? else {
                continue;
            };
            if !existing.contains(SYNC_DEVICE_COLUMN) {
                continue;
            }

            let mut stmt = conn.prepare(&format!(
                "SELECT DISTINCT {SYNC_DEVICE_COLUMN} FROM {table}
                 WHERE {SYNC_DEVICE_COLUMN} IS NOT NULL"
            ))?;
            for device in stmt.query_map([], |row| row.get::<_, String>(0))? {
                devices.insert(device?);
            }
        }

        Ok(devices.into_iter().collect())
    }
}


fn optional<T>(result: ::duckdb::Result<T>) -> ::duckdb::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(::duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}


fn quote_path(path: &Path) -> String {
    path.to_string_lossy().replace('\'', "''")
}


/// Column names of `table` in `catalog` (default: the open database),
/// or `None` if the table does not exist.
fn table_columns(conn: &Connection, catalog: Option<&str>, table: Table) -> Result<Option<HashSet<String>>> {
    let mut stmt = conn.prepare(
        "SELECT column_name FROM duckdb_columns()
         WHERE database_name = COALESCE(CAST(? AS VARCHAR), current_database())
           AND schema_name = 'main'
           AND table_name = ?",
    )?;
    let columns = stmt
        .query_map(params![catalog, table.name()], |row| row.get::<_, String>(0))?
        .collect::<::duckdb::Result<HashSet<_>>>()?;

    Ok((!columns.is_empty()).then_some(columns))
}


/// Secondary index on `table`, as (name, column).
fn date_index(table: Table) -> Option<(&'static str, &'static str)> {
    match table {
        Table::UsageRecords => Some(("idx_usage_records_date", "date")),
        Table::LimitsSnapshots => Some(("idx_limits_snapshots_date", "date")),
        _ => None,
    }
}


/// Add any device column `table` lacks. Returns false if the table is missing.
fn add_missing_device_columns(conn: &Connection, table: Table) -> Result<bool> {
    let Some(existing) = table_columns(conn, None, table)? else {
        debug!(table = %table, "Table does not exist, skipping");
        return Ok(false);
    };

    let missing: Vec<&str> = DEVICE_COLUMNS
        .into_iter()
        .filter(|column| !existing.contains(*column))
        .collect();
    if missing.is_empty() {
        return Ok(true);
    }

    // Secondary indexes block ALTER TABLE
    let index = date_index(table);
    if let Some((name, _)) = index {
        conn.execute_batch(&format!("DROP INDEX IF EXISTS {name}"))?;
    }
    for column in missing {
        info!(table = %table, column, "Adding device column");
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} VARCHAR"))?;
    }
    if let Some((name, column)) = index {
        conn.execute_batch(&format!("CREATE INDEX IF NOT EXISTS {name} ON {table}({column})"))?;
    }

    Ok(true)
}


fn record_exists(conn: &Connection, session_id: &str, message_uuid: &str) -> ::duckdb::Result<bool> {
    Ok(optional(conn.query_row(
        "SELECT 1 FROM usage_records WHERE session_id = ? AND message_uuid = ?",
        params![session_id, message_uuid],
        |_| Ok(()),
    ))?
    .is_some())
}


/// Insert records whose (session, message) key is new; returns how many.
fn insert_records(conn: &Connection, records: &[UsageRecord], tag: &DeviceTag) -> Result<usize> {
    let mut saved_count = 0;

    for record in records {
        if record_exists(conn, &record.session_id, &record.message_uuid)? {
            continue;
        }
        insert_stored_record(conn, &StoredRecord::from_record(record, tag))?;
        saved_count += 1;
    }

    Ok(saved_count)
}


fn insert_stored_record(conn: &Connection, row: &StoredRecord) -> ::duckdb::Result<usize> {
    conn.execute(
        INSERT_RECORD,
        params![
            row.date,
            row.timestamp,
            row.session_id,
            row.message_uuid,
            row.message_type,
            row.model,
            row.folder,
            row.git_branch,
            row.version,
            row.tokens.input_tokens,
            row.tokens.output_tokens,
            row.tokens.cache_creation_tokens,
            row.tokens.cache_read_tokens,
            row.total_tokens,
            row.device.device_id,
            row.device.device_name,
            row.device.device_type,
        ],
    )
}


/// Recompute the ledger for every date that still has raw records.
fn refresh_daily_from_records(conn: &Connection, timestamp: &str, tag: &DeviceTag) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO daily_snapshots (
            date, total_prompts, total_responses, total_sessions, total_tokens,
            input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens,
            snapshot_timestamp, device_id, device_name, device_type
        )
        SELECT
            date,
            CAST(SUM(CASE WHEN message_type = 'user' THEN 1 ELSE 0 END) AS BIGINT),
            CAST(SUM(CASE WHEN message_type = 'assistant' THEN 1 ELSE 0 END) AS BIGINT),
            COUNT(DISTINCT session_id),
            CAST(SUM(total_tokens) AS BIGINT),
            CAST(SUM(input_tokens) AS BIGINT),
            CAST(SUM(output_tokens) AS BIGINT),
            CAST(SUM(cache_creation_tokens) AS BIGINT),
            CAST(SUM(cache_read_tokens) AS BIGINT),
            CAST(? AS VARCHAR), CAST(? AS VARCHAR), CAST(? AS VARCHAR), CAST(? AS VARCHAR)
        FROM usage_records
        GROUP BY date",
        params![timestamp, tag.device_id, tag.device_name, tag.device_type],
    )?;
    Ok(())
}


/// Add the batch's per-day totals onto the ledger; returns dates touched.
fn merge_daily_totals(
    conn: &Connection,
    records: &[UsageRecord],
    timestamp: &str,
    tag: &DeviceTag,
) -> Result<usize> {
    let daily = aggregate_by_day(records);

    for (date, day) in &daily {
        let exists = optional(conn.query_row(
            "SELECT 1 FROM daily_snapshots WHERE date = ?",
            params![date],
            |_| Ok(()),
        ))?
        .is_some();

        if exists {
            conn.execute(
                "UPDATE daily_snapshots SET
                    total_prompts = total_prompts + ?,
                    total_responses = total_responses + ?,
                    total_sessions = total_sessions + ?,
                    total_tokens = total_tokens + ?,
                    input_tokens = input_tokens + ?,
                    output_tokens = output_tokens + ?,
                    cache_creation_tokens = cache_creation_tokens + ?,
                    cache_read_tokens = cache_read_tokens + ?,
                    snapshot_timestamp = ?,
                    device_id = COALESCE(device_id, CAST(? AS VARCHAR)),
                    device_name = COALESCE(device_name, CAST(? AS VARCHAR)),
                    device_type = COALESCE(device_type, CAST(? AS VARCHAR))
                 WHERE date = ?",
                params![
                    day.total_prompts,
                    day.total_responses,
                    day.total_sessions(),
                    day.total_tokens(),
                    day.tokens.input_tokens,
                    day.tokens.output_tokens,
                    day.tokens.cache_creation_tokens,
                    day.tokens.cache_read_tokens,
                    timestamp,
                    tag.device_id,
                    tag.device_name,
                    tag.device_type,
                    date,
                ],
            )?;
        } else {
            conn.execute(
                UPSERT_DAILY,
                params![
                    date,
                    day.total_prompts,
                    day.total_responses,
                    day.total_sessions(),
                    day.total_tokens(),
                    day.tokens.input_tokens,
                    day.tokens.output_tokens,
                    day.tokens.cache_creation_tokens,
                    day.tokens.cache_read_tokens,
                    timestamp,
                    tag.device_id,
                    tag.device_name,
                    tag.device_type,
                ],
            )?;
        }
    }

    Ok(daily.len())
}


fn upsert_limits(conn: &Connection, l: &LimitsSnapshot) -> ::duckdb::Result<usize> {
    let exists = optional(conn.query_row(
        "SELECT 1 FROM limits_snapshots WHERE timestamp = ?",
        params![l.timestamp],
        |_| Ok(()),
    ))?
    .is_some();

    if exists {
        conn.execute(
            UPDATE_LIMITS,
            params![
                l.reading.session_pct,
                l.reading.week_pct,
                l.reading.opus_pct,
                l.reading.session_reset,
                l.reading.week_reset,
                l.reading.opus_reset,
                l.device.device_id,
                l.device.device_name,
                l.device.device_type,
                l.timestamp,
            ],
        )
    } else {
        conn.execute(
            INSERT_LIMITS,
            params![
                l.timestamp,
                l.date,
                l.reading.session_pct,
                l.reading.week_pct,
                l.reading.opus_pct,
                l.reading.session_reset,
                l.reading.week_reset,
                l.reading.opus_reset,
                l.device.device_id,
                l.device.device_name,
                l.device.device_type,
            ],
        )
    }
}


fn upsert_fingerprint(conn: &Connection, fingerprint: &FileFingerprint) -> ::duckdb::Result<usize> {
    conn.execute(
        UPSERT_FINGERPRINT,
        params![
            fingerprint.file_path,
            fingerprint.mtime_ns,
            fingerprint.size_bytes,
            fingerprint.record_count,
            fingerprint.last_parsed,
        ],
    )
}


/// Write one migrated row. Raw records are never duplicated.
fn import_row(conn: &Connection, row: &TableRow) -> ::duckdb::Result<bool> {
    match row {
        TableRow::Daily(s) => conn
            .execute(
                UPSERT_DAILY,
                params![
                    s.date,
                    s.total_prompts,
                    s.total_responses,
                    s.total_sessions,
                    s.total_tokens,
                    s.input_tokens,
                    s.output_tokens,
                    s.cache_creation_tokens,
                    s.cache_read_tokens,
                    s.snapshot_timestamp,
                    s.device.device_id,
                    s.device.device_name,
                    s.device.device_type,
                ],
            )
            .map(|_| true),
        TableRow::Record(r) => {
            if record_exists(conn, &r.session_id, &r.message_uuid)? {
                return Ok(false);
            }
            insert_stored_record(conn, r).map(|_| true)
        }
        TableRow::Limits(l) => upsert_limits(conn, l).map(|_| true),
        TableRow::Fingerprint(f) => upsert_fingerprint(conn, f).map(|_| true),
        TableRow::Pricing(p) => conn
            .execute(
                UPSERT_PRICING,
                params![
                    p.price.model_name,
                    p.price.rates.input,
                    p.price.rates.output,
                    p.price.rates.cache_write,
                    p.price.rates.cache_read,
                    p.last_updated,
                    p.price.notes,
                ],
            )
            .map(|_| true),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use crate::models::TokenUsage;

    fn record(session: &str, uuid: &str) -> UsageRecord {
        UsageRecord {
            timestamp: "2025-03-01T12:00:00Z".parse().unwrap(),
            session_id: session.to_string(),
            message_uuid: uuid.to_string(),
            message_type: "assistant".to_string(),
            model: Some("claude-sonnet-4-20250514".to_string()),
            folder: "/test".to_string(),
            git_branch: None,
            version: "1.0.0".to_string(),
            token_usage: Some(TokenUsage {
                input_tokens: 100,
                output_tokens: 200,
                cache_creation_tokens: 0,
                cache_read_tokens: 0,
            }),
            device: DeviceTag::default(),
        }
    }

    #[test]
    fn test_init_database() {
        let tmp_dir = TempDir::new().unwrap();
        let db_path = tmp_dir.path().join("test.duckdb");

        let store = DuckDbStore::open(&db_path).unwrap();
        assert!(db_path.exists());
        assert!(store.has_device_columns().unwrap());

        // Re-opening replaces pricing without tripping key constraints
        DuckDbStore::open(&db_path).unwrap();
    }

    #[test]
    fn test_duplicate_prevention() {
        let tmp_dir = TempDir::new().unwrap();
        let store = DuckDbStore::open(&tmp_dir.path().join("test.duckdb")).unwrap();

        let batch = [record("s1", "u1"), record("s1", "u1"), record("s1", "u2")];
        assert_eq!(store.save(&batch, StorageMode::Full, None).unwrap(), 2);
        assert_eq!(store.save(&batch, StorageMode::Full, None).unwrap(), 0);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.total_tokens, 600);
    }

    #[test]
    fn test_legacy_table_gains_device_columns() {
        let tmp_dir = TempDir::new().unwrap();
        let db_path = tmp_dir.path().join("legacy.duckdb");
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute_batch(
                "CREATE TABLE file_metadata (file_path VARCHAR, mtime_ns BIGINT, size_bytes BIGINT,
                    record_count BIGINT, last_parsed VARCHAR);
                 CREATE TABLE limits_snapshots (timestamp VARCHAR, date VARCHAR,
                    session_pct BIGINT, week_pct BIGINT, opus_pct BIGINT,
                    session_reset VARCHAR, week_reset VARCHAR, opus_reset VARCHAR);
                 INSERT INTO limits_snapshots VALUES
                    ('2025-03-01T09:00:00+00:00', '2025-03-01', 1, 2, 3, '', '', '');",
            )
            .unwrap();
        }

        let store = DuckDbStore::open_existing(&db_path).unwrap();
        assert!(!store.has_device_columns().unwrap());

        let tagged = store
            .add_device_columns(&DeviceIdentity::new("laptop", "Laptop", "linux"))
            .unwrap();
        assert_eq!(tagged, 1);
        assert!(store.has_device_columns().unwrap());

        let latest = store.latest_limits().unwrap().unwrap();
        assert_eq!(latest.device.device_id.as_deref(), Some("laptop"));
    }
}
