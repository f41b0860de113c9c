//! Model pricing registry.
//!
//! Costs are in nanodollars (1e-9 USD) per token.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Pricing information for a model.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    /// Provider name.
    pub provider: &'static str,
    /// Cost per input token in nanodollars.
    pub input_nanos_per_token: i64,
    /// Cost per output token in nanodollars.
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    const fn new(provider: &'static str, input: i64, output: i64) -> Self {
        Self {
            provider,
            input_nanos_per_token: input,
            output_nanos_per_token: output,
        }
    }

    /// Calculate cost for a request.
    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        (input_tokens as i64) * self.input_nanos_per_token
            + (output_tokens as i64) * self.output_nanos_per_token
    }
}

// =============================================================================
// PRICING DATA
// =============================================================================

// OpenRouter pricing (verify periodically against OpenRouter model pages)
// Claude Sonnet 4 / 4.5: $3.00/1M input, $15.00/1M output
// Claude Haiku 4.5: $1.00/1M input, $5.00/1M output
// Claude Opus 4.5: $5.00/1M input, $25.00/1M output
// GPT-4o: $2.50/1M input, $10.00/1M output
// GPT-5-mini: $0.25/1M input, $2.00/1M output
// Gemini 2.5 Flash: $0.30/1M input, $2.50/1M output

const CLAUDE_SONNET_4: ModelPricing = ModelPricing::new("openrouter", 3_000, 15_000);
const CLAUDE_HAIKU_4_5: ModelPricing = ModelPricing::new("openrouter", 1_000, 5_000);
const CLAUDE_OPUS_4_5: ModelPricing = ModelPricing::new("openrouter", 5_000, 25_000);
const GPT_4O: ModelPricing = ModelPricing::new("openrouter", 2_500, 10_000);
const GPT_5_MINI: ModelPricing = ModelPricing::new("openrouter", 250, 2_000);
const GEMINI_2_5_FLASH: ModelPricing = ModelPricing::new("openrouter", 300, 2_500);

static PRICING_MAP: OnceLock<HashMap<&'static str, ModelPricing>> = OnceLock::new();

fn init_pricing() -> HashMap<&'static str, ModelPricing> {
    let mut map = HashMap::new();

    map.insert("anthropic/claude-sonnet-4", CLAUDE_SONNET_4);
    map.insert("anthropic/claude-sonnet-4.5", CLAUDE_SONNET_4);
    map.insert("anthropic/claude-haiku-4.5", CLAUDE_HAIKU_4_5);
    map.insert("anthropic/claude-opus-4.5", CLAUDE_OPUS_4_5);
    map.insert("openai/gpt-4o", GPT_4O);
    map.insert("openai/gpt-5-mini", GPT_5_MINI);
    map.insert("google/gemini-2.5-flash", GEMINI_2_5_FLASH);

    map
}

/// Get pricing for a model.
pub fn get_pricing(model_id: &str) -> Option<ModelPricing> {
    let map = PRICING_MAP.get_or_init(init_pricing);
    map.get(model_id).copied()
}

/// Calculate chat cost.
pub fn chat_cost(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    // Vision-capable mid-range default for unknown models
    let default = ModelPricing::new("unknown", 3_000, 15_000);
    let pricing = get_pricing(model).unwrap_or(default);
    pricing.calculate_cost(input_tokens, output_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_cost() {
        // 1K input + 1K output for Claude Sonnet 4.5
        // Input: 1000 * 3000 = 3,000,000 nanos
        // Output: 1000 * 15000 = 15,000,000 nanos
        let cost = chat_cost("anthropic/claude-sonnet-4.5", 1_000, 1_000);
        assert_eq!(cost, 18_000_000);
    }

    #[test]
    fn unknown_models_fall_back_to_default_rate() {
        assert!(get_pricing("acme/unknown").is_none());
        assert_eq!(chat_cost("acme/unknown", 1, 1), 18_000);
    }
}
