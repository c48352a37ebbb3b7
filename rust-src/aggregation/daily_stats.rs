//! Daily statistics aggregation.

use std::collections::{BTreeMap, HashSet};

use crate::models::{TokenUsage, UsageRecord};


/// Totals for one date bucket of an incoming batch.
#[derive(Debug, Clone, Default)]
pub struct DailyTotals {
    pub date: String,
    pub total_prompts: i64,
    pub total_responses: i64,
    pub sessions: HashSet<String>,
    pub tokens: TokenUsage,
}


impl DailyTotals {
    pub fn total_sessions(&self) -> i64 {
        self.sessions.len() as i64
    }

    pub fn total_tokens(&self) -> i64 {
        self.tokens.total_tokens()
    }
}


/// Aggregate usage records by day, ordered by date.
pub fn aggregate_by_day(records: &[UsageRecord]) -> BTreeMap<String, DailyTotals> {
    let mut daily: BTreeMap<String, DailyTotals> = BTreeMap::new();

    for record in records {
        let date = record.date_key();
        let day = daily.entry(date.clone()).or_insert_with(|| DailyTotals {
            date,
            ..Default::default()
        });
        add_record(day, record);
    }

    daily
}


fn add_record(day: &mut DailyTotals, record: &UsageRecord) {
    day.sessions.insert(record.session_id.clone());

    // Count message types
    if record.is_user_prompt() {
        day.total_prompts += 1;
    } else if record.is_assistant_response() {
        day.total_responses += 1;
    }

    // Token usage only available on assistant responses
    if let Some(usage) = &record.token_usage {
        day.tokens.input_tokens += usage.input_tokens;
        day.tokens.output_tokens += usage.output_tokens;
        day.tokens.cache_creation_tokens += usage.cache_creation_tokens;
        day.tokens.cache_read_tokens += usage.cache_read_tokens;
    }
}
