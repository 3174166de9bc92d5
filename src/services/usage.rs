// Usage Accounting Service
// Per-run token ledger and per-model cost computation

use crate::models::{ModelUsage, ProviderUsage, UsageRecord};
use crate::services::config_store::ModelRate;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// USD per 1k tokens.
pub struct RateTable {
    rates: HashMap<String, ModelRate>,
}

impl Default for RateTable {
    fn default() -> Self {
        let mut rates = HashMap::new();
        rates.insert(
            "gpt-3.5-turbo".to_string(),
            ModelRate { prompt_per1k: 0.001, completion_per1k: 0.002 },
        );
        rates.insert(
            "deepseek-chat".to_string(),
            ModelRate { prompt_per1k: 0.00014, completion_per1k: 0.00028 },
        );
        rates.insert(
            "text-embedding-ada-002".to_string(),
            ModelRate { prompt_per1k: 0.0001, completion_per1k: 0.0 },
        );
        Self { rates }
    }
}

impl RateTable {
    /// Built-in rates with configured entries layered on top.
    pub fn with_overrides(overrides: &HashMap<String, ModelRate>) -> Self {
        let mut table = Self::default();
        for (model, rate) in overrides {
            table.rates.insert(model.clone(), *rate);
        }
        table
    }

    pub fn rate(&self, model: &str) -> Option<ModelRate> {
        self.rates.get(model).copied()
    }

    /// Unrounded cost; `None` for models without a rate.
    pub fn cost(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> Option<f64> {
        self.rate(model).map(|r| {
            (prompt_tokens as f64 * r.prompt_per1k + completion_tokens as f64 * r.completion_per1k)
                / 1000.0
        })
    }
}

pub fn round_cost(cost: f64) -> f64 {
    (cost * 1_000_000.0).round() / 1_000_000.0
}

#[derive(Debug, Clone, Default)]
struct LedgerEntry {
    prompt_tokens: u64,
    completion_tokens: u64,
    calls: u32,
}

/// Invocation-scoped token ledger. Every external call, successful or
/// charged-but-failed, is recorded here; cost is only computed at `finish`.
#[derive(Debug, Clone, Default)]
pub struct UsageLedger {
    /// Models in first-use order.
    order: Vec<String>,
    by_model: HashMap<String, LedgerEntry>,
    calls: u32,
    failed_calls: u32,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, usage: &ProviderUsage) {
        if !self.by_model.contains_key(&usage.model_name) {
            self.order.push(usage.model_name.clone());
        }
        let entry = self.by_model.entry(usage.model_name.clone()).or_default();
        entry.prompt_tokens += usage.prompt_tokens;
        entry.completion_tokens += usage.completion_tokens;
        entry.calls += 1;
    }

    pub fn record_success(&mut self, usage: &ProviderUsage) {
        self.calls += 1;
        self.add(usage);
    }

    /// A failed attempt. Tokens are only added when the provider charged them.
    pub fn record_failure(&mut self, charged: Option<&ProviderUsage>) {
        self.calls += 1;
        self.failed_calls += 1;
        if let Some(usage) = charged {
            self.add(usage);
        }
    }

    /// Fold another ledger in; used to combine per-task ledgers in index order.
    pub fn merge(&mut self, other: UsageLedger) {
        for model in other.order {
            if let Some(entry) = other.by_model.get(&model) {
                if !self.by_model.contains_key(&model) {
                    self.order.push(model.clone());
                }
                let mine = self.by_model.entry(model).or_default();
                mine.prompt_tokens += entry.prompt_tokens;
                mine.completion_tokens += entry.completion_tokens;
                mine.calls += entry.calls;
            }
        }
        self.calls += other.calls;
        self.failed_calls += other.failed_calls;
    }

    pub fn total_tokens(&self) -> u64 {
        self.by_model
            .values()
            .map(|e| e.prompt_tokens + e.completion_tokens)
            .sum()
    }

    pub fn calls(&self) -> u32 {
        self.calls
    }

    pub fn failed_calls(&self) -> u32 {
        self.failed_calls
    }

    pub fn finish(&self, rates: &RateTable) -> UsageRecord {
        let mut record = UsageRecord {
            calls: self.calls,
            failed_calls: self.failed_calls,
            model_name: self.order.join(","),
            ..UsageRecord::default()
        };
        let mut by_model = BTreeMap::new();
        let mut cost = 0.0;

        for model in &self.order {
            let Some(entry) = self.by_model.get(model) else {
                continue;
            };
            let model_cost = match rates.cost(model, entry.prompt_tokens, entry.completion_tokens) {
                Some(c) => c,
                None => {
                    warn!("[pipeline] no rate configured for model {}, costing at 0", model);
                    0.0
                }
            };
            cost += model_cost;
            record.prompt_tokens += entry.prompt_tokens;
            record.completion_tokens += entry.completion_tokens;
            by_model.insert(
                model.clone(),
                ModelUsage {
                    prompt_tokens: entry.prompt_tokens,
                    completion_tokens: entry.completion_tokens,
                    total_tokens: entry.prompt_tokens + entry.completion_tokens,
                    calls: entry.calls,
                    cost_estimate: round_cost(model_cost),
                },
            );
        }

        record.total_tokens = record.prompt_tokens + record.completion_tokens;
        record.cost_estimate = round_cost(cost);
        record.by_model = by_model;
        record
    }
}
