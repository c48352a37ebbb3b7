//! Shared replica files holding several devices' rows.
//!
//! A push replaces every replica row owned by the pushing device with that
//! device's current local rows, table by table. Rows from other devices are
//! never touched.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use tracing::warn;

use crate::config::StorageFormat;
use crate::storage::{open_existing_store, SnapshotStore, Table};


/// Owner id used when a supplied device id is unusable.
pub const UNKNOWN_DEVICE: &str = "unknown";


/// What a push left in the replica for the pushing device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplicaReport {
    pub device_id: String,
    pub tables: Vec<String>,
    pub rows: BTreeMap<String, i64>,
}

impl ReplicaReport {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            ..Default::default()
        }
    }

    /// Note that `table` was pushed and now holds `rows` for this device.
    pub fn record(&mut self, table: Table, rows: i64) {
        self.tables.push(table.name().to_string());
        self.rows.insert(table.name().to_string(), rows);
    }

    pub fn total_rows(&self) -> i64 {
        self.rows.values().sum()
    }
}


/// Owner id a push will tag rows with.
pub fn replica_device_id(device_id: &str) -> String {
    let valid = !device_id.is_empty()
        && device_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if valid {
        device_id.to_string()
    } else {
        warn!(device_id, fallback = UNKNOWN_DEVICE, "Invalid device id for replica push");
        UNKNOWN_DEVICE.to_string()
    }
}


/// Push `local`'s rows into the replica at `replica_path` under `device_id`.
///
/// The replica uses the same engine as `local` and is created if missing.
pub fn push_replica(local: &dyn SnapshotStore, replica_path: &Path, device_id: &str) -> Result<ReplicaReport> {
    local.push_replica(replica_path, device_id)
}


/// Device ids with rows in an existing replica file.
pub fn replica_devices(replica_path: &Path, format: StorageFormat) -> Result<Vec<String>> {
    open_existing_store(replica_path, format)?.replica_devices()
}
