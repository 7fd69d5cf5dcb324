//! Token usage accounting.

use serde::{Deserialize, Serialize};

/// Token usage reported by the provider for a single stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_tokens: Option<u32>,
}

impl Usage {
    /// Fold a later usage report from the same stream into this one.
    ///
    /// Providers report cumulative output counts on each turn delta, so the
    /// larger value wins rather than being summed.
    pub fn absorb(&mut self, update: &Usage) {
        self.input_tokens = self.input_tokens.max(update.input_tokens);
        self.output_tokens = self.output_tokens.max(update.output_tokens);
        if let Some(v) = update.cache_read_tokens {
            self.cache_read_tokens = Some(self.cache_read_tokens.unwrap_or(0).max(v));
        }
        if let Some(v) = update.cache_creation_tokens {
            self.cache_creation_tokens = Some(self.cache_creation_tokens.unwrap_or(0).max(v));
        }
    }
}

/// Usage across every turn of a run, with reasoning split from message output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct UsageSummary {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    pub message_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

impl UsageSummary {
    /// Add one turn's usage. `reasoning_tokens` is the estimate for that turn's
    /// reasoning text; it is capped at the reported output.
    pub fn add_turn(&mut self, usage: &Usage, reasoning_tokens: u64) {
        let output = u64::from(usage.output_tokens);
        let reasoning = reasoning_tokens.min(output);
        self.input_tokens += u64::from(usage.input_tokens);
        self.output_tokens += output;
        self.reasoning_tokens += reasoning;
        self.message_tokens += output - reasoning;
        self.cache_read_tokens += u64::from(usage.cache_read_tokens.unwrap_or(0));
        self.cache_creation_tokens += u64::from(usage.cache_creation_tokens.unwrap_or(0));
    }
}

/// Rough token estimate for text the provider does not count separately.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
