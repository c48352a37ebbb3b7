//! Daily ledger, file fingerprint and pricing rows.

use serde::{Deserialize, Serialize};

use crate::models::{DeviceTag, TokenUsage};


/// Daily snapshot of aggregated usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySnapshot {
    pub date: String,
    pub total_prompts: i64,
    pub total_responses: i64,
    pub total_sessions: i64,
    pub total_tokens: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub snapshot_timestamp: String,
    pub device: DeviceTag,
}


/// Last-seen state of a source log file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub file_path: String,
    pub mtime_ns: i64,
    pub size_bytes: i64,
    pub record_count: i64,
    pub last_parsed: String,
}


/// Prices in dollars per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenRates {
    pub input: f64,
    pub output: f64,
    pub cache_write: f64,
    pub cache_read: f64,
}

impl TokenRates {
    /// Dollar cost of `usage` at these rates.
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.input_tokens as f64 / 1_000_000.0) * self.input
            + (usage.output_tokens as f64 / 1_000_000.0) * self.output
            + (usage.cache_creation_tokens as f64 / 1_000_000.0) * self.cache_write
            + (usage.cache_read_tokens as f64 / 1_000_000.0) * self.cache_read
    }
}


/// Price list entry for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub model_name: String,
    pub rates: TokenRates,
    pub notes: String,
}


/// A row of the `model_pricing` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRow {
    pub price: ModelPrice,
    pub last_updated: String,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_cost() {
        let rates = TokenRates {
            input: 3.0,
            output: 15.0,
            cache_write: 3.75,
            cache_read: 0.30,
        };
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 100_000,
            cache_creation_tokens: 0,
            cache_read_tokens: 2_000_000,
        };
        assert!((rates.cost(&usage) - 5.1).abs() < 1e-9);
    }
}
