//! Model price list used to seed the `model_pricing` table.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::models::{ModelPrice, TokenRates};


/// Built-in prices: (model, input, output, cache write, cache read, notes).
pub const BUILTIN_PRICING: &[(&str, f64, f64, f64, f64, &str)] = &[
    ("claude-opus-4-5-20251101", 15.00, 75.00, 18.75, 1.50, "Claude Opus 4.5 - Current flagship model"),
    ("claude-opus-4-1-20250805", 15.00, 75.00, 18.75, 1.50, "Claude Opus 4.1"),
    ("claude-sonnet-4-5-20250929", 3.00, 15.00, 3.75, 0.30, "Claude Sonnet 4.5 - Current balanced model"),
    ("claude-sonnet-4-20250514", 3.00, 15.00, 3.75, 0.30, "Claude Sonnet 4"),
    ("claude-haiku-4-5-20251001", 1.00, 5.00, 1.25, 0.10, "Claude Haiku 4.5 - Fast model"),
    ("claude-haiku-3-5-20241022", 0.80, 4.00, 1.00, 0.08, "Claude 3.5 Haiku - Legacy fast model"),
    ("claude-sonnet-3-7-20250219", 3.00, 15.00, 3.75, 0.30, "Claude Sonnet 3.7 - Legacy"),
    ("claude-opus-4-20250514", 15.00, 75.00, 18.75, 1.50, "Claude Opus 4 - Legacy"),
    ("<synthetic>", 0.00, 0.00, 0.00, 0.00, "Test/synthetic model - no cost"),
];


#[derive(Debug, Deserialize)]
struct PricingFile {
    #[serde(default)]
    models: BTreeMap<String, PricingEntry>,
}


#[derive(Debug, Deserialize)]
struct PricingEntry {
    #[serde(default)]
    input_per_mtok: f64,
    #[serde(default)]
    output_per_mtok: f64,
    #[serde(default)]
    cache_write_per_mtok: f64,
    #[serde(default)]
    cache_read_per_mtok: f64,
    #[serde(default)]
    notes: String,
}


/// The full set of prices written on database initialization.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceList {
    prices: Vec<ModelPrice>,
}


impl PriceList {
    pub fn builtin() -> Self {
        let prices = BUILTIN_PRICING
            .iter()
            .map(|&(model, input, output, cache_write, cache_read, notes)| ModelPrice {
                model_name: model.to_string(),
                rates: TokenRates {
                    input,
                    output,
                    cache_write,
                    cache_read,
                },
                notes: notes.to_string(),
            })
            .collect();
        Self { prices }
    }

    pub fn new(prices: Vec<ModelPrice>) -> Self {
        Self { prices }
    }

    /// Parse a `{"models": {"<name>": {...}}}` document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: PricingFile = serde_json::from_str(json).context("Invalid pricing JSON")?;
        if file.models.is_empty() {
            anyhow::bail!("Pricing file lists no models");
        }

        let prices = file
            .models
            .into_iter()
            .map(|(model_name, entry)| ModelPrice {
                model_name,
                rates: TokenRates {
                    input: entry.input_per_mtok,
                    output: entry.output_per_mtok,
                    cache_write: entry.cache_write_per_mtok,
                    cache_read: entry.cache_read_per_mtok,
                },
                notes: entry.notes,
            })
            .collect();
        Ok(Self { prices })
    }

    /// Load a pricing file, falling back to the built-in list on any problem.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            debug!(path = %path.display(), "No pricing file, using built-in prices");
            return Self::builtin();
        }

        let loaded = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pricing file: {}", path.display()))
            .and_then(|json| Self::from_json_str(&json));

        match loaded {
            Ok(list) => list,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Falling back to built-in prices");
                Self::builtin()
            }
        }
    }

    pub fn prices(&self) -> &[ModelPrice] {
        &self.prices
    }

    pub fn get(&self, model: &str) -> Option<&ModelPrice> {
        self.prices.iter().find(|p| p.model_name == model)
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}


impl Default for PriceList {
    fn default() -> Self {
        Self::builtin()
    }
}
