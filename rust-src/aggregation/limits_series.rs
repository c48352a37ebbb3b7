//! Backfilled daily series of usage-limit percentages.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use tracing::warn;

use crate::models::DailyLimits;


/// Expand per-day maxima into one entry per calendar date.
///
/// Covers every date from the earliest to the latest observed day. A day
/// without data takes the nearest later observed day; failing that, the
/// nearest earlier resolved day; failing that, zeros.
pub fn backfill_daily_limits(maxima: &BTreeMap<String, DailyLimits>) -> BTreeMap<String, DailyLimits> {
    let observed: BTreeMap<NaiveDate, DailyLimits> = maxima
        .iter()
        .filter_map(|(date, limits)| match NaiveDate::parse_from_str(date, "%Y-%m-%d") {
            Ok(day) => Some((day, *limits)),
            Err(_) => {
                warn!(date = %date, "Skipping limits row with unparseable date");
                None
            }
        })
        .collect();

    let (Some(&start), Some(&end)) = (observed.keys().next(), observed.keys().next_back()) else {
        return BTreeMap::new();
    };

    let mut resolved: BTreeMap<NaiveDate, DailyLimits> = BTreeMap::new();
    let mut current = start;

    while current <= end {
        let limits = match observed.get(&current) {
            Some(limits) => *limits,
            None => observed
                .range(current..)
                .next()
                .map(|(_, limits)| *limits)
                .or_else(|| resolved.range(..current).next_back().map(|(_, limits)| *limits))
                .unwrap_or_default(),
        };
        resolved.insert(current, limits);
        current += Duration::days(1);
    }

    resolved
        .into_iter()
        .map(|(day, limits)| (day.format("%Y-%m-%d").to_string(), limits))
        .collect()
}
