//! Usage-limit readings.

use serde::{Deserialize, Serialize};

use crate::models::DeviceTag;


/// One observation of the three usage-limit meters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsReading {
    pub session_pct: i64,
    pub week_pct: i64,
    pub opus_pct: i64,
    pub session_reset: String,
    pub week_reset: String,
    pub opus_reset: String,
}


/// A row of the `limits_snapshots` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsSnapshot {
    pub timestamp: String,
    pub date: String,
    pub reading: LimitsReading,
    pub device: DeviceTag,
}


/// Per-day maximum of the weekly and opus meters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyLimits {
    pub week_pct: i64,
    pub opus_pct: i64,
}
