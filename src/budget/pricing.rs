//! Static model pricing.
//!
//! Prices are USD per 1K tokens. A model matches every key that occurs in
//! its name; the longest key wins, so `gpt-4o-mini` is not billed as `gpt-4`.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PricingInfo {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl PricingInfo {
    pub const FREE: PricingInfo = PricingInfo {
        input_per_1k: 0.0,
        output_per_1k: 0.0,
    };

    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let raw = input_tokens as f64 / 1000.0 * self.input_per_1k
            + output_tokens as f64 / 1000.0 * self.output_per_1k;
        round6(raw)
    }
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

#[derive(Debug, Clone)]
pub struct ModelPricing {
    table: Vec<(String, PricingInfo)>,
}

impl ModelPricing {
    pub fn new() -> Self {
        let entries: [(&str, f64, f64); 8] = [
            ("gpt-4", 0.03, 0.06),
            ("gpt-4-turbo", 0.01, 0.03),
            ("gpt-4o", 0.005, 0.015),
            ("gpt-4o-mini", 0.00015, 0.0006),
            ("gpt-3.5-turbo", 0.0005, 0.0015),
            ("llama", 0.0, 0.0),
            ("mistral", 0.0, 0.0),
            ("codellama", 0.0, 0.0),
        ];
        Self {
            table: entries
                .into_iter()
                .map(|(key, input, output)| {
                    (
                        key.to_string(),
                        PricingInfo {
                            input_per_1k: input,
                            output_per_1k: output,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Pricing for `model`, if any key matches.
    pub fn lookup(&self, model: &str) -> Option<PricingInfo> {
        let model = model.to_lowercase();
        self.table
            .iter()
            .filter(|(key, _)| model.contains(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, info)| *info)
    }

    /// Estimated USD cost of a run. Unknown models are free.
    pub fn estimate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        match self.lookup(model) {
            Some(info) => info.cost(input_tokens, output_tokens),
            None => {
                tracing::warn!(model = %model, "No pricing for model; reporting zero cost");
                0.0
            }
        }
    }
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_key_wins() {
        let pricing = ModelPricing::new();
        assert_eq!(pricing.lookup("gpt-4").unwrap().input_per_1k, 0.03);
        assert_eq!(pricing.lookup("gpt-4-turbo-preview").unwrap().input_per_1k, 0.01);
        assert_eq!(pricing.lookup("gpt-4o-2024-08-06").unwrap().input_per_1k, 0.005);
        assert_eq!(pricing.lookup("gpt-4o-mini").unwrap().output_per_1k, 0.0006);
        assert_eq!(pricing.lookup("llama3.2:latest"), Some(PricingInfo::FREE));
        assert!(pricing.lookup("claude-3").is_none());
    }

    #[test]
    fn test_cost_is_rounded() {
        let pricing = ModelPricing::new();
        assert_eq!(pricing.estimate_cost("gpt-4", 1000, 500), 0.06);
        assert_eq!(pricing.estimate_cost("gpt-4o-mini", 7, 3), 0.000003);
        assert_eq!(pricing.estimate_cost("mistral", 10_000, 10_000), 0.0);
        assert_eq!(pricing.estimate_cost("unknown-model", 10_000, 10_000), 0.0);
    }
}
