//! Data models, one typed struct per persisted table.

mod device_tag;
mod limits;
mod snapshot;
mod usage_record;

pub use device_tag::DeviceTag;
pub use limits::{DailyLimits, LimitsReading, LimitsSnapshot};
pub use snapshot::{DailySnapshot, FileFingerprint, ModelPrice, PricingRow, TokenRates};
pub use usage_record::{StoredRecord, TokenUsage, UsageRecord};
