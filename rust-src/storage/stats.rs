//! Totals, per-model cost breakdown and derived averages.

use std::collections::HashMap;

use serde::Serialize;

use crate::models::{TokenRates, TokenUsage};


/// Sums over the daily ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerTotals {
    pub total_tokens: i64,
    pub total_prompts: i64,
    pub total_responses: i64,
    pub total_sessions: i64,
}


/// Raw-record token sums for one model, with its rates when priced.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelUsage {
    pub model: String,
    pub tokens: TokenUsage,
    pub total_tokens: i64,
    pub rates: Option<TokenRates>,
}


impl ModelUsage {
    /// Assemble from summed token columns and optionally joined prices.
    ///
    /// Order of both arrays is input, output, cache write, cache read.
    pub fn from_sums(
        model: String,
        sums: [Option<i64>; 4],
        total_tokens: Option<i64>,
        prices: [Option<f64>; 4],
    ) -> Self {
        let rates = prices.iter().any(Option::is_some).then(|| TokenRates {
            input: prices[0].unwrap_or(0.0),
            output: prices[1].unwrap_or(0.0),
            cache_write: prices[2].unwrap_or(0.0),
            cache_read: prices[3].unwrap_or(0.0),
        });

        Self {
            model,
            tokens: TokenUsage {
                input_tokens: sums[0].unwrap_or(0),
                output_tokens: sums[1].unwrap_or(0),
                cache_creation_tokens: sums[2].unwrap_or(0),
                cache_read_tokens: sums[3].unwrap_or(0),
            },
            total_tokens: total_tokens.unwrap_or(0),
            rates,
        }
    }
}


/// What an engine reads from disk to build `DatabaseStats`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsInputs {
    pub total_records: i64,
    pub total_days: i64,
    pub oldest_date: Option<String>,
    pub newest_date: Option<String>,
    pub newest_timestamp: Option<String>,
    pub ledger: LedgerTotals,
    pub models: Vec<ModelUsage>,
}


/// Database statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseStats {
    pub total_records: i64,
    pub total_days: i64,
    pub oldest_date: Option<String>,
    pub newest_date: Option<String>,
    pub newest_timestamp: Option<String>,
    pub total_tokens: i64,
    pub total_prompts: i64,
    pub total_responses: i64,
    pub total_sessions: i64,
    pub tokens_by_model: HashMap<String, i64>,
    pub cost_by_model: HashMap<String, f64>,
    pub total_cost: f64,
    pub avg_tokens_per_session: i64,
    pub avg_tokens_per_response: i64,
    pub avg_cost_per_session: f64,
    pub avg_cost_per_response: f64,
}


impl DatabaseStats {
    /// Price each model and derive averages.
    ///
    /// Models without rates keep their tokens and cost nothing.
    pub fn from_inputs(inputs: StatsInputs) -> Self {
        let mut tokens_by_model = HashMap::new();
        let mut cost_by_model = HashMap::new();
        let mut total_cost = 0.0;

        for usage in inputs.models {
            let cost = usage.rates.map(|r| r.cost(&usage.tokens)).unwrap_or(0.0);
            total_cost += cost;
            tokens_by_model.insert(usage.model.clone(), usage.total_tokens);
            cost_by_model.insert(usage.model, cost);
        }

        let ledger = inputs.ledger;

        Self {
            total_records: inputs.total_records,
            total_days: inputs.total_days,
            oldest_date: inputs.oldest_date,
            newest_date: inputs.newest_date,
            newest_timestamp: inputs.newest_timestamp,
            total_tokens: ledger.total_tokens,
            total_prompts: ledger.total_prompts,
            total_responses: ledger.total_responses,
            total_sessions: ledger.total_sessions,
            tokens_by_model,
            cost_by_model,
            total_cost,
            avg_tokens_per_session: ratio(ledger.total_tokens as f64, ledger.total_sessions).round() as i64,
            avg_tokens_per_response: ratio(ledger.total_tokens as f64, ledger.total_responses).round() as i64,
            avg_cost_per_session: ratio(total_cost, ledger.total_sessions),
            avg_cost_per_response: ratio(total_cost, ledger.total_responses),
        }
    }
}


fn ratio(numerator: f64, denominator: i64) -> f64 {
    if denominator > 0 {
        numerator / denominator as f64
    } else {
        0.0
    }
}
