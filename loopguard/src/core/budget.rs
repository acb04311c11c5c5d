//! Cost and time budget helpers.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Time left until `deadline`, or `None` once it has passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|remaining| !remaining.is_zero())
}

/// Monotonically increasing spend counter with an optional ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct CostLedger {
    spent: f64,
    limit: Option<f64>,
}

impl CostLedger {
    pub fn new(limit: Option<f64>) -> Self {
        Self { spent: 0.0, limit }
    }

    /// Record spend. Negative or non-finite amounts are ignored so the
    /// counter never decreases.
    pub fn add(&mut self, amount: f64) {
        if amount.is_finite() && amount > 0.0 {
            self.spent += amount;
        }
    }

    /// Lower the ceiling to `limit` if it is tighter than the current one.
    pub fn cap(&mut self, limit: f64) {
        self.limit = Some(self.limit.map_or(limit, |current| current.min(limit)));
    }

    pub fn spent(&self) -> f64 {
        self.spent
    }

    pub fn limit(&self) -> Option<f64> {
        self.limit
    }

    /// True once cumulative spend has reached the ceiling.
    pub fn exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.spent >= limit)
    }
}

/// Token counts reported by a model invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Find the last usage report in line-delimited JSON output.
    ///
    /// Accepts objects carrying `input_tokens`/`output_tokens` directly or
    /// under a `usage` key; non-JSON lines are ignored.
    pub fn scan(output: &str) -> Option<TokenUsage> {
        output.lines().rev().find_map(|line| {
            let value: Value = serde_json::from_str(line.trim()).ok()?;
            usage_from_value(&value)
        })
    }
}

fn usage_from_value(value: &Value) -> Option<TokenUsage> {
    let object = value.as_object()?;
    if let Some(nested) = object.get("usage").and_then(usage_from_value) {
        return Some(nested);
    }
    let input = object.get("input_tokens")?.as_u64()?;
    let output = object.get("output_tokens")?.as_u64()?;
    Some(TokenUsage {
        input_tokens: input,
        output_tokens: output,
    })
}

/// Dollar price per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    pub fn cost(&self, usage: TokenUsage) -> f64 {
        (usage.input_tokens as f64 * self.input_per_million
            + usage.output_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

const BUILTIN_PRICING: &[(&str, ModelPricing)] = &[
    ("gemini-2.0-flash", ModelPricing::new(0.10, 0.40)),
    ("gemini-2.0-pro", ModelPricing::new(1.25, 5.00)),
    ("gemini-1.5-flash", ModelPricing::new(0.075, 0.30)),
    ("gemini-1.5-pro", ModelPricing::new(1.25, 5.00)),
];

const DEFAULT_PRICING: ModelPricing = ModelPricing::new(0.10, 0.40);

/// Price lookup: configured overrides first, then built-ins, then the default.
pub fn pricing_for(model: &str, overrides: &BTreeMap<String, ModelPricing>) -> ModelPricing {
    if let Some(pricing) = overrides.get(model) {
        return *pricing;
    }
    BUILTIN_PRICING
        .iter()
        .find(|(name, _)| *name == model)
        .map_or(DEFAULT_PRICING, |(_, pricing)| *pricing)
}
