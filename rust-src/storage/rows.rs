//! Positional row decoders shared by both engines.
//!
//! rusqlite and duckdb expose the same `Row::get` shape but distinct types,
//! so the decoders are macros expanded inside each engine's row closure.
//! Every macro expects the column order of `Table::columns()`.

macro_rules! daily_snapshot_from_row {
    ($row:expr) => {
        $crate::models::DailySnapshot {
            date: $row.get(0)?,
            total_prompts: $row.get(1)?,
            total_responses: $row.get(2)?,
            total_sessions: $row.get(3)?,
            total_tokens: $row.get(4)?,
            input_tokens: $row.get(5)?,
            output_tokens: $row.get(6)?,
            cache_creation_tokens: $row.get(7)?,
            cache_read_tokens: $row.get(8)?,
            snapshot_timestamp: $row.get(9)?,
            device: $crate::models::DeviceTag {
                device_id: $row.get(10)?,
                device_name: $row.get(11)?,
                device_type: $row.get(12)?,
            },
        }
    };
}


macro_rules! stored_record_from_row {
    ($row:expr) => {
        $crate::models::StoredRecord {
            date: $row.get(0)?,
            timestamp: $row.get(1)?,
            session_id: $row.get(2)?,
            message_uuid: $row.get(3)?,
            message_type: $row.get(4)?,
            model: $row.get(5)?,
            folder: $row.get(6)?,
            git_branch: $row.get(7)?,
            version: $row.get(8)?,
            tokens: $crate::models::TokenUsage {
                input_tokens: $row.get(9)?,
                output_tokens: $row.get(10)?,
                cache_creation_tokens: $row.get(11)?,
                cache_read_tokens: $row.get(12)?,
            },
            total_tokens: $row.get(13)?,
            device: $crate::models::DeviceTag {
                device_id: $row.get(14)?,
                device_name: $row.get(15)?,
                device_type: $row.get(16)?,
            },
        }
    };
}


macro_rules! limits_snapshot_from_row {
    ($row:expr) => {
        $crate::models::LimitsSnapshot {
            timestamp: $row.get(0)?,
            date: $row.get(1)?,
            reading: $crate::models::LimitsReading {
                session_pct: $row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                week_pct: $row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                opus_pct: $row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                session_reset: $row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                week_reset: $row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                opus_reset: $row.get::<_, Option<String>>(7)?.unwrap_or_default(),
            },
            device: $crate::models::DeviceTag {
                device_id: $row.get(8)?,
                device_name: $row.get(9)?,
                device_type: $row.get(10)?,
            },
        }
    };
}


macro_rules! fingerprint_from_row {
    ($row:expr) => {
        $crate::models::FileFingerprint {
            file_path: $row.get(0)?,
            mtime_ns: $row.get(1)?,
            size_bytes: $row.get(2)?,
            record_count: $row.get(3)?,
            last_parsed: $row.get(4)?,
        }
    };
}


macro_rules! pricing_from_row {
    ($row:expr) => {
        $crate::models::PricingRow {
            price: $crate::models::ModelPrice {
                model_name: $row.get(0)?,
                rates: $crate::models::TokenRates {
                    input: $row.get(1)?,
                    output: $row.get(2)?,
                    cache_write: $row.get(3)?,
                    cache_read: $row.get(4)?,
                },
                notes: $row.get::<_, Option<String>>(6)?.unwrap_or_default(),
            },
            last_updated: $row.get(5)?,
        }
    };
}


pub(crate) use daily_snapshot_from_row;
pub(crate) use fingerprint_from_row;
pub(crate) use limits_snapshot_from_row;
pub(crate) use pricing_from_row;
pub(crate) use stored_record_from_row;
