//! In-memory aggregation shared by both storage engines.

mod daily_stats;
mod limits_series;

pub use daily_stats::{aggregate_by_day, DailyTotals};
pub use limits_series::backfill_daily_limits;
