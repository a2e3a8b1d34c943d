//! LLM token cost accounting.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::metrics::{MetricsCollector, MetricsResult};

/// Counter accumulating total spend in USD.
pub const COST_METRIC: &str = "workflow.cost_usd";
/// Counter of prompt tokens.
pub const INPUT_TOKENS_METRIC: &str = "llm.tokens.input";
/// Counter of completion tokens.
pub const OUTPUT_TOKENS_METRIC: &str = "llm.tokens.output";
/// Counter of usage reports for models missing from the pricing table.
pub const UNPRICED_METRIC: &str = "llm.cost.unpriced";

/// Token usage reported by a model call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Model identifier the tokens were billed against.
    pub model: String,
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Creates a usage record.
    #[must_use]
    pub fn new(model: impl Into<String>, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            model: model.into(),
            input_tokens,
            output_tokens,
        }
    }

    /// Total tokens across prompt and completion.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Price of one model, in USD per 1K tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// USD per 1K prompt tokens.
    pub input_per_1k: f64,
    /// USD per 1K completion tokens.
    pub output_per_1k: f64,
}

impl ModelPricing {
    /// Computes the USD cost of `usage`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.input_tokens as f64 / 1000.0) * self.input_per_1k
            + (usage.output_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

/// Converts token usage to cost and records both as counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CostTracker {
    pricing: HashMap<String, ModelPricing>,
}

impl CostTracker {
    /// Creates a tracker with an empty pricing table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the pricing of `model`.
    #[must_use]
    pub fn with_pricing(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.pricing.insert(model.into(), pricing);
        self
    }

    /// Returns the pricing for `model`, if known.
    #[must_use]
    pub fn pricing(&self, model: &str) -> Option<&ModelPricing> {
        self.pricing.get(model)
    }

    /// Estimates the cost of `usage`; `None` when the model is not priced.
    #[must_use]
    pub fn estimate(&self, usage: &TokenUsage) -> Option<f64> {
        self.pricing.get(&usage.model).map(|pricing| pricing.cost(usage))
    }

    /// Records tokens and cost for one model call and returns the cost charged.
    ///
    /// An explicit `cost_usd` reported by the caller takes precedence over the
    /// pricing table. Unpriced models are charged zero and counted in
    /// [`UNPRICED_METRIC`].
    ///
    /// # Errors
    ///
    /// Propagates [`crate::MetricsError`] from the underlying counters.
    #[allow(clippy::cast_precision_loss)]
    pub fn record(
        &self,
        metrics: &MetricsCollector,
        usage: Option<&TokenUsage>,
        cost_usd: Option<f64>,
    ) -> MetricsResult<f64> {
        if let Some(usage) = usage {
            metrics.increment_counter(INPUT_TOKENS_METRIC, usage.input_tokens as f64)?;
            metrics.increment_counter(OUTPUT_TOKENS_METRIC, usage.output_tokens as f64)?;
        }

        let cost = match (cost_usd, usage) {
            (Some(cost), _) => cost,
            (None, Some(usage)) => self.estimate(usage).unwrap_or_else(|| {
                debug!(model = %usage.model, "no pricing for model; charging zero");
                let _ = metrics.increment(UNPRICED_METRIC);
                0.0
            }),
            (None, None) => 0.0,
        };

        metrics.increment_counter(COST_METRIC, cost)?;
        Ok(cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> CostTracker {
        CostTracker::new().with_pricing(
            "gpt-4o",
            ModelPricing {
                input_per_1k: 0.005,
                output_per_1k: 0.015,
            },
        )
    }

    #[test]
    fn priced_usage_records_tokens_and_cost() {
        let metrics = MetricsCollector::default();
        let usage = TokenUsage::new("gpt-4o", 2000, 1000);

        let cost = tracker().record(&metrics, Some(&usage), None).unwrap();
        assert!((cost - 0.025).abs() < 1e-12);
        assert_eq!(metrics.counter(INPUT_TOKENS_METRIC), Some(2000.0));
        assert_eq!(metrics.counter(OUTPUT_TOKENS_METRIC), Some(1000.0));
        assert!((metrics.counter(COST_METRIC).unwrap() - 0.025).abs() < 1e-12);
    }

    #[test]
    fn explicit_cost_wins_over_pricing() {
        let metrics = MetricsCollector::default();
        let usage = TokenUsage::new("gpt-4o", 2000, 1000);

        let cost = tracker().record(&metrics, Some(&usage), Some(0.5)).unwrap();
        assert_eq!(cost, 0.5);
    }

    #[test]
    fn unpriced_models_are_counted() {
        let metrics = MetricsCollector::default();
        let usage = TokenUsage::new("mystery-model", 10, 10);

        let cost = tracker().record(&metrics, Some(&usage), None).unwrap();
        assert_eq!(cost, 0.0);
        assert_eq!(metrics.counter(UNPRICED_METRIC), Some(1.0));
        assert_eq!(metrics.counter(COST_METRIC), Some(0.0));
    }

    #[test]
    fn negative_explicit_cost_is_rejected() {
        let metrics = MetricsCollector::default();
        assert!(tracker().record(&metrics, None, Some(-1.0)).is_err());
    }
}
