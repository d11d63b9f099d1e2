use crate::chat::Usage;
use crate::registry::ModelRegistry;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Accumulated token/cost totals for one `(provider, model)` pair.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelUsage {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cached_tokens: u64,
    pub reasoning_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageStats {
    pub by_model: HashMap<String, ModelUsage>,
    pub total_requests: u64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_cost_usd: f64,
}

/// Records token usage and computes cost against [`ModelRegistry`] pricing
/// after every completed request. One entry per `provider/model` key.
pub struct UsageLedger {
    entries: Mutex<HashMap<String, ModelUsage>>,
}

impl Default for UsageLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageLedger {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn record(&self, registry: &ModelRegistry, provider: &str, model: &str, usage: &Usage) {
        let key = format!("{provider}/{model}");
        let pricing = registry.get_model_pricing(provider, model);
        let cost = pricing
            .map(|p| {
                let input = (usage.prompt_tokens as f64) * p.input / 1_000_000.0;
                let output = (usage.completion_tokens as f64) * p.output / 1_000_000.0;
                input + output
            })
            .unwrap_or(0.0);

        let mut entries = self.entries.lock().await;
        let entry = entries.entry(key).or_default();
        entry.requests += 1;
        entry.prompt_tokens += usage.prompt_tokens as u64;
        entry.completion_tokens += usage.completion_tokens as u64;
        entry.cached_tokens += usage.cached_tokens.unwrap_or(0) as u64;
        entry.reasoning_tokens += usage.reasoning_tokens.unwrap_or(0) as u64;
        entry.cost_usd += cost;
    }

    pub async fn stats(&self) -> UsageStats {
        let entries = self.entries.lock().await;
        let mut stats = UsageStats {
            by_model: entries.clone(),
            ..UsageStats::default()
        };
        for usage in entries.values() {
            stats.total_requests += usage.requests;
            stats.total_prompt_tokens += usage.prompt_tokens;
            stats.total_completion_tokens += usage.completion_tokens;
            stats.total_cost_usd += usage.cost_usd;
        }
        stats
    }

    pub async fn reset(&self) {
        self.entries.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelRegistry;

    fn usage(prompt: u32, completion: u32) -> Usage {
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
            reasoning_tokens: None,
            cached_tokens: None,
        }
    }

    #[tokio::test]
    async fn records_accumulate_across_calls() {
        let ledger = UsageLedger::new();
        let registry = ModelRegistry::new_for_test();
        ledger.record(&registry, "openai", "gpt-4-turbo", &usage(100, 50)).await;
        ledger.record(&registry, "openai", "gpt-4-turbo", &usage(200, 75)).await;

        let stats = ledger.stats().await;
        let entry = stats.by_model.get("openai/gpt-4-turbo").unwrap();
        assert_eq!(entry.requests, 2);
        assert_eq!(entry.prompt_tokens, 300);
        assert_eq!(entry.completion_tokens, 125);
        assert!(entry.cost_usd > 0.0);
    }

    #[tokio::test]
    async fn unknown_model_records_usage_with_zero_cost() {
        let ledger = UsageLedger::new();
        let registry = ModelRegistry::new_for_test();
        ledger.record(&registry, "unknown", "mystery", &usage(10, 10)).await;
        let stats = ledger.stats().await;
        assert_eq!(stats.by_model.get("unknown/mystery").unwrap().cost_usd, 0.0);
    }

    #[tokio::test]
    async fn reset_clears_all_entries() {
        let ledger = UsageLedger::new();
        let registry = ModelRegistry::new_for_test();
        ledger.record(&registry, "openai", "gpt-4-turbo", &usage(10, 10)).await;
        ledger.reset().await;
        let stats = ledger.stats().await;
        assert_eq!(stats.total_requests, 0);
    }
}
