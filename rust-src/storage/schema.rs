//! Logical schema shared by both engines.
//!
//! Column names and order here drive every SELECT list, so the row
//! decoders in `rows.rs` can read by position on either engine.

use std::collections::HashSet;
use std::fmt;

use crate::models::{DailySnapshot, FileFingerprint, LimitsSnapshot, PricingRow, StoredRecord};


pub const DEVICE_COLUMNS: [&str; 3] = ["device_id", "device_name", "device_type"];

/// Column carrying the owning device on replica tables.
pub const SYNC_DEVICE_COLUMN: &str = "sync_device_id";


/// The five canonical tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    DailySnapshots,
    UsageRecords,
    LimitsSnapshots,
    FileMetadata,
    ModelPricing,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::DailySnapshots,
        Table::UsageRecords,
        Table::LimitsSnapshots,
        Table::FileMetadata,
        Table::ModelPricing,
    ];

    pub const WITH_DEVICE_COLUMNS: [Table; 3] = [
        Table::DailySnapshots,
        Table::UsageRecords,
        Table::LimitsSnapshots,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::DailySnapshots => "daily_snapshots",
            Self::UsageRecords => "usage_records",
            Self::LimitsSnapshots => "limits_snapshots",
            Self::FileMetadata => "file_metadata",
            Self::ModelPricing => "model_pricing",
        }
    }

    /// Data columns in canonical order, excluding surrogate ids and device columns.
    pub fn data_columns(self) -> &'static [&'static str] {
        match self {
            Self::DailySnapshots => &[
                "date",
                "total_prompts",
                "total_responses",
                "total_sessions",
                "total_tokens",
                "input_tokens",
                "output_tokens",
                "cache_creation_tokens",
                "cache_read_tokens",
                "snapshot_timestamp",
            ],
            Self::UsageRecords => &[
                "date",
                "timestamp",
                "session_id",
                "message_uuid",
                "message_type",
                "model",
                "folder",
                "git_branch",
                "version",
                "input_tokens",
                "output_tokens",
                "cache_creation_tokens",
                "cache_read_tokens",
                "total_tokens",
            ],
            Self::LimitsSnapshots => &[
                "timestamp",
                "date",
                "session_pct",
                "week_pct",
                "opus_pct",
                "session_reset",
                "week_reset",
                "opus_reset",
            ],
            Self::FileMetadata => &[
                "file_path",
                "mtime_ns",
                "size_bytes",
                "record_count",
                "last_parsed",
            ],
            Self::ModelPricing => &[
                "model_name",
                "input_price_per_mtok",
                "output_price_per_mtok",
                "cache_write_price_per_mtok",
                "cache_read_price_per_mtok",
                "last_updated",
                "notes",
            ],
        }
    }

    pub fn has_device_columns(self) -> bool {
        Self::WITH_DEVICE_COLUMNS.contains(&self)
    }

    /// Data columns followed by device columns where the table has them.
    pub fn columns(self) -> Vec<&'static str> {
        let mut columns = self.data_columns().to_vec();
        if self.has_device_columns() {
            columns.extend(DEVICE_COLUMNS);
        }
        columns
    }

    fn order_by(self) -> &'static str {
        match self {
            Self::DailySnapshots => "date",
            Self::UsageRecords => "date, timestamp",
            Self::LimitsSnapshots => "timestamp",
            Self::FileMetadata => "file_path",
            Self::ModelPricing => "model_name",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}


/// One row of any table, as moved by migrations.
#[derive(Debug, Clone, PartialEq)]
pub enum TableRow {
    Daily(DailySnapshot),
    Record(StoredRecord),
    Limits(LimitsSnapshot),
    Fingerprint(FileFingerprint),
    Pricing(PricingRow),
}

impl TableRow {
    pub fn table(&self) -> Table {
        match self {
            Self::Daily(_) => Table::DailySnapshots,
            Self::Record(_) => Table::UsageRecords,
            Self::Limits(_) => Table::LimitsSnapshots,
            Self::Fingerprint(_) => Table::FileMetadata,
            Self::Pricing(_) => Table::ModelPricing,
        }
    }
}


/// Outcome of writing a batch of migrated rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    pub written: usize,
    pub errors: Vec<String>,
}


/// SELECT list for `table` in canonical order.
///
/// Device columns missing from an older schema are selected as typed
/// NULLs so decoders and `CREATE TABLE AS` see the full shape.
pub fn select_list(table: Table, existing: &HashSet<String>, text_type: &str) -> String {
    table
        .columns()
        .into_iter()
        .map(|column| {
            if existing.contains(column) {
                column.to_string()
            } else {
                format!("CAST(NULL AS {text_type}) AS {column}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}


/// Full-table export query.
pub fn export_query(table: Table, existing: &HashSet<String>, text_type: &str) -> String {
    format!(
        "SELECT {} FROM {} ORDER BY {}",
        select_list(table, existing, text_type),
        table.name(),
        table.order_by()
    )
}


/// Optional inclusive date-range filter, as SQL suffix plus bound values.
pub fn date_filter(start_date: Option<&str>, end_date: Option<&str>) -> (String, Vec<String>) {
    let mut clause = String::new();
    let mut values = Vec::new();

    if let Some(start) = start_date {
        clause.push_str(" AND date >= ?");
        values.push(start.to_string());
    }
    if let Some(end) = end_date {
        clause.push_str(" AND date <= ?");
        values.push(end.to_string());
    }

    (clause, values)
}
