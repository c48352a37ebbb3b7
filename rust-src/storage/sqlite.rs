//! SQLite storage engine.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
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
        date TEXT PRIMARY KEY,
        total_prompts INTEGER NOT NULL,
        total_responses INTEGER NOT NULL,
        total_sessions INTEGER NOT NULL,
        total_tokens INTEGER NOT NULL,
        input_tokens INTEGER NOT NULL,
        output_tokens INTEGER NOT NULL,
        cache_creation_tokens INTEGER NOT NULL,
        cache_read_tokens INTEGER NOT NULL,
        snapshot_timestamp TEXT NOT NULL,
        device_id TEXT,
        device_name TEXT,
        device_type TEXT
    );

    CREATE TABLE IF NOT EXISTS usage_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        date TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        session_id TEXT NOT NULL,
        message_uuid TEXT NOT NULL,
        message_type TEXT NOT NULL,
        model TEXT,
        folder TEXT NOT NULL,
        git_branch TEXT,
        version TEXT NOT NULL,
        input_tokens INTEGER NOT NULL,
        output_tokens INTEGER NOT NULL,
        cache_creation_tokens INTEGER NOT NULL,
        cache_read_tokens INTEGER NOT NULL,
        total_tokens INTEGER NOT NULL,
        device_id TEXT,
        device_name TEXT,
        device_type TEXT,
        UNIQUE(session_id, message_uuid)
    );

    CREATE TABLE IF NOT EXISTS limits_snapshots (
        timestamp TEXT PRIMARY KEY,
        date TEXT NOT NULL,
        session_pct INTEGER,
        week_pct INTEGER,
        opus_pct INTEGER,
        session_reset TEXT,
        week_reset TEXT,
        opus_reset TEXT,
        device_id TEXT,
        device_name TEXT,
        device_type TEXT
    );

    CREATE TABLE IF NOT EXISTS file_metadata (
        file_path TEXT PRIMARY KEY,
        mtime_ns INTEGER NOT NULL,
        size_bytes INTEGER NOT NULL,
        record_count INTEGER NOT NULL,
        last_parsed TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS model_pricing (
        model_name TEXT PRIMARY KEY,
        input_price_per_mtok REAL NOT NULL,
        output_price_per_mtok REAL NOT NULL,
        cache_write_price_per_mtok REAL NOT NULL,
        cache_read_price_per_mtok REAL NOT NULL,
        last_updated TEXT NOT NULL,
        notes TEXT
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
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)";

const UPSERT_DAILY: &str = "
    INSERT OR REPLACE INTO daily_snapshots (
        date, total_prompts, total_responses, total_sessions, total_tokens,
        input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens,
        snapshot_timestamp, device_id, device_name, device_type
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)";

const UPSERT_LIMITS: &str = "
    INSERT OR REPLACE INTO limits_snapshots (
        timestamp, date, session_pct, week_pct, opus_pct,
        session_reset, week_reset, opus_reset,
        device_id, device_name, device_type
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

const UPSERT_FINGERPRINT: &str = "
    INSERT OR REPLACE INTO file_metadata (
        file_path, mtime_ns, size_bytes, record_count, last_parsed
    ) VALUES (?1, ?2, ?3, ?4, ?5)";

const UPSERT_PRICING: &str = "
    INSERT OR REPLACE INTO model_pricing (
        model_name, input_price_per_mtok, output_price_per_mtok,
        cache_write_price_per_mtok, cache_read_price_per_mtok,
        last_updated, notes
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";


/// A SQLite database file holding one device's history.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}


impl SqliteStore {
    /// Open a database, creating and upgrading tables as needed.
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

    /// Initialize the database with required tables and fresh pricing.
    fn init(&self, pricing: &PriceList) -> Result<()> {
        ensure_parent_dir(&self.path)?;

        let mut conn = self.connect()?;
        conn.execute_batch(SCHEMA)?;

        // Tables created before multi-device support lack the device columns
        for table in Table::WITH_DEVICE_COLUMNS {
            add_missing_device_columns(&conn, table)?;
        }
        conn.execute_batch(INDEXES)?;

        let timestamp = Utc::now().to_rfc3339();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM model_pricing", [])?;
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


impl SnapshotStore for SqliteStore {
    fn format(&self) -> StorageFormat {
        StorageFormat::Sqlite
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
            .collect::<rusqlite::Result<Vec<StoredRecord>>>()?;

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
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(snapshots)
    }

    fn record_limits_at(
        &self,
        reading: &LimitsReading,
        device: Option<&DeviceIdentity>,
        observed_at: DateTime<Local>,
    ) -> Result<()> {
        let tag = DeviceTag::stamp(device);
        let conn = self.connect()?;

        conn.execute(
            UPSERT_LIMITS,
            params![
                observed_at.to_rfc3339(),
                observed_at.format("%Y-%m-%d").to_string(),
                reading.session_pct,
                reading.week_pct,
                reading.opus_pct,
                reading.session_reset,
                reading.week_reset,
                reading.opus_reset,
                tag.device_id,
                tag.device_name,
                tag.device_type,
            ],
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
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;

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

        let latest = conn
            .query_row(&query, [], |row| Ok(limits_snapshot_from_row!(row)))
            .optional()?;

        Ok(latest)
    }

    fn stats_inputs(&self) -> Result<StatsInputs> {
        if !self.path.exists() {
            return Ok(StatsInputs::default());
        }

        let conn = self.connect()?;

        let (total_records, total_days, oldest_date, newest_date): (i64, i64, Option<String>, Option<String>) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT date), MIN(date), MAX(date) FROM usage_records",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        let (newest_timestamp, ledger): (Option<String>, LedgerTotals) = conn.query_row(
            "SELECT MAX(snapshot_timestamp),
                    COALESCE(SUM(total_tokens), 0), COALESCE(SUM(total_prompts), 0),
                    COALESCE(SUM(total_responses), 0), COALESCE(SUM(total_sessions), 0)
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
                        SUM(ur.input_tokens), SUM(ur.output_tokens),
                        SUM(ur.cache_creation_tokens), SUM(ur.cache_read_tokens),
                        SUM(ur.total_tokens),
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
            rows.collect::<rusqlite::Result<Vec<_>>>()?
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
        if table_columns(&conn, "main", Table::FileMetadata)?.is_none() {
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
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;

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

        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM file_metadata WHERE file_path = ?1")?;
            for path in paths {
                removed += stmt.execute([path])?;
            }
        }
        tx.commit()?;

        Ok(removed)
    }

    fn fingerprint_count(&self) -> Result<i64> {
        if !self.path.exists() {
            return Ok(0);
        }

        let conn = self.connect()?;
        if table_columns(&conn, "main", Table::FileMetadata)?.is_none() {
            return Ok(0);
        }
        Ok(conn.query_row("SELECT COUNT(*) FROM file_metadata", [], |row| row.get(0))?)
    }

    fn export_table(&self, table: Table) -> Result<Option<Vec<TableRow>>> {
        let conn = self.connect()?;
        let Some(existing) = table_columns(&conn, "main", table)? else {
            debug!(table = %table, "Table does not exist, skipping");
            return Ok(None);
        };

        let query = export_query(table, &existing, "TEXT");
        let mut stmt = conn.prepare(&query)?;

        let rows = match table {
            Table::DailySnapshots => stmt
                .query_map([], |row| Ok(TableRow::Daily(daily_snapshot_from_row!(row))))?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            Table::UsageRecords => stmt
                .query_map([], |row| Ok(TableRow::Record(stored_record_from_row!(row))))?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            Table::LimitsSnapshots => stmt
                .query_map([], |row| Ok(TableRow::Limits(limits_snapshot_from_row!(row))))?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            Table::FileMetadata => stmt
                .query_map([], |row| Ok(TableRow::Fingerprint(fingerprint_from_row!(row))))?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            Table::ModelPricing => stmt
                .query_map([], |row| Ok(TableRow::Pricing(pricing_from_row!(row))))?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };

        Ok(Some(rows))
    }

    fn import_rows(&self, rows: &[TableRow]) -> Result<ImportOutcome> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let mut outcome = ImportOutcome::default();

        for row in rows {
            match import_row(&tx, row) {
                Ok(true) => outcome.written += 1,
                Ok(false) => debug!(table = %row.table(), "Skipping existing row"),
                Err(e) => outcome.errors.push(format!("{}: {e}", row.table())),
            }
        }

        tx.commit()?;
        Ok(outcome)
    }

    fn add_device_columns(&self, device: &DeviceIdentity) -> Result<usize> {
        let conn = self.connect()?;
        let mut updated = 0;

        for table in Table::WITH_DEVICE_COLUMNS {
            if !add_missing_device_columns(&conn, table)? {
                continue;
            }

            updated += conn.execute(
                &format!(
                    "UPDATE {table}
                     SET device_id = ?1, device_name = ?2, device_type = ?3
                     WHERE device_id IS NULL"
                ),
                params![device.id, device.name, device.device_type],
            )?;
        }

        Ok(updated)
    }

    fn has_device_columns(&self) -> Result<bool> {
        let conn = self.connect()?;

        for table in Table::WITH_DEVICE_COLUMNS {
            if let Some(existing) = table_columns(&conn, "main", table)? {
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

        let mut conn = Connection::open(replica_path)
            .with_context(|| format!("Failed to open replica: {}", replica_path.display()))?;
        conn.execute(
            "ATTACH DATABASE ?1 AS local_db",
            [self.path.to_string_lossy()],
        )?;

        let mut report = ReplicaReport::new(&device_id);
        let tx = conn.transaction()?;

        for table in Table::ALL {
            let Some(existing) = table_columns(&tx, "local_db", table)? else {
                continue;
            };
            let select = select_list(table, &existing, "TEXT");
            let columns = table.columns().join(", ");

            tx.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS main.{table} AS
                 SELECT {select}, CAST(NULL AS TEXT) AS {SYNC_DEVICE_COLUMN}
                 FROM local_db.{table} WHERE 0"
            ))?;

            tx.execute(
                &format!("DELETE FROM main.{table} WHERE {SYNC_DEVICE_COLUMN} = ?1"),
                [&device_id],
            )?;
            tx.execute(
                &format!(
                    "INSERT INTO main.{table} ({columns}, {SYNC_DEVICE_COLUMN})
                     SELECT {select}, ?1 FROM local_db.{table}"
                ),
                [&device_id],
            )?;

            let rows: i64 = tx.query_row(
                &format!("SELECT COUNT(*) FROM main.{table} WHERE {SYNC_DEVICE_COLUMN} = ?1"),
                [&device_id],
                |row| row.get(0),
            )?;
            report.record(table, rows);
        }

        tx.commit()?;
        conn.execute("DETACH DATABASE local_db", [])?;

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
            let Some(existing) = table_columns(&conn, "main", table)? else {
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


/// Column names of `schema.table`, or `None` if the table does not exist.
fn table_columns(conn: &Connection, schema: &str, table: Table) -> Result<Option<HashSet<String>>> {
    let exists: Option<String> = conn
        .query_row(
            &format!("SELECT name FROM {schema}.sqlite_master WHERE type = 'table' AND name = ?1"),
            [table.name()],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Ok(None);
    }

    let mut stmt = conn.prepare(&format!("PRAGMA {schema}.table_info({table})"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;

    Ok(Some(columns))
}


/// Add any device column `table` lacks. Returns false if the table is missing.
fn add_missing_device_columns(conn: &Connection, table: Table) -> Result<bool> {
    let Some(existing) = table_columns(conn, "main", table)? else {
        debug!(table = %table, "Table does not exist, skipping");
        return Ok(false);
    };

    for column in DEVICE_COLUMNS {
        if !existing.contains(column) {
            info!(table = %table, column, "Adding device column");
            conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} TEXT"), [])?;
        }
    }

    Ok(true)
}


/// Insert records whose (session, message) key is new; returns how many.
fn insert_records(conn: &Connection, records: &[UsageRecord], tag: &DeviceTag) -> Result<usize> {
    let mut stmt = conn.prepare(INSERT_RECORD)?;
    let mut saved_count = 0;

    for record in records {
        let row = StoredRecord::from_record(record, tag);
        match execute_record_insert(&mut stmt, &row) {
            Ok(_) => saved_count += 1,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                // Record already exists, skip
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(saved_count)
}


fn execute_record_insert(stmt: &mut rusqlite::Statement<'_>, row: &StoredRecord) -> rusqlite::Result<usize> {
    stmt.execute(params![
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
    ])
}


/// Recompute the ledger for every date that still has raw records.
///
/// Dates whose records have all aged out are not touched.
fn refresh_daily_from_records(conn: &Connection, timestamp: &str, tag: &DeviceTag) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO daily_snapshots (
            date, total_prompts, total_responses, total_sessions, total_tokens,
            input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens,
            snapshot_timestamp, device_id, device_name, device_type
        )
        SELECT
            date,
            SUM(CASE WHEN message_type = 'user' THEN 1 ELSE 0 END),
            SUM(CASE WHEN message_type = 'assistant' THEN 1 ELSE 0 END),
            COUNT(DISTINCT session_id),
            SUM(total_tokens),
            SUM(input_tokens),
            SUM(output_tokens),
            SUM(cache_creation_tokens),
            SUM(cache_read_tokens),
            ?1, ?2, ?3, ?4
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
        let exists = conn
            .query_row("SELECT 1 FROM daily_snapshots WHERE date = ?1", [date], |_| Ok(()))
            .optional()?
            .is_some();

        if exists {
            conn.execute(
                "UPDATE daily_snapshots SET
                    total_prompts = total_prompts + ?2,
                    total_responses = total_responses + ?3,
                    total_sessions = total_sessions + ?4,
                    total_tokens = total_tokens + ?5,
                    input_tokens = input_tokens + ?6,
                    output_tokens = output_tokens + ?7,
                    cache_creation_tokens = cache_creation_tokens + ?8,
                    cache_read_tokens = cache_read_tokens + ?9,
                    snapshot_timestamp = ?10,
                    device_id = COALESCE(device_id, ?11),
                    device_name = COALESCE(device_name, ?12),
                    device_type = COALESCE(device_type, ?13)
                 WHERE date = ?1",
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


fn upsert_fingerprint(conn: &Connection, fingerprint: &FileFingerprint) -> rusqlite::Result<usize> {
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
fn import_row(conn: &Connection, row: &TableRow) -> rusqlite::Result<bool> {
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
            let exists = conn
                .query_row(
                    "SELECT 1 FROM usage_records WHERE session_id = ?1 AND message_uuid = ?2",
                    params![r.session_id, r.message_uuid],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                return Ok(false);
            }
            let mut stmt = conn.prepare_cached(INSERT_RECORD)?;
            execute_record_insert(&mut stmt, r).map(|_| true)
        }
        TableRow::Limits(l) => conn
            .execute(
                UPSERT_LIMITS,
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
            .map(|_| true),
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
