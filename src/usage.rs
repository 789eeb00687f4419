//! Normalized usage accounting, `ClaudeUsage`-shaped. See SPEC_FULL.md §4.6.
//!
//! Grounded in `llm::TokenUsage` (saturating accumulation) and
//! `backend::shared::Usage` (the four-field cache-aware shape), merged into
//! one canonical type every upstream's native usage body converts into.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_write_input_tokens: u64,
}

impl NormalizedUsage {
    /// A usage result is authoritative only once it reports some real
    /// token count; partial/zeroed chunks must not overwrite a prior
    /// authoritative value.
    pub fn is_authoritative(&self) -> bool {
        self.input_tokens > 0 || self.output_tokens > 0
    }

    /// Later chunks overwrite earlier partial counts once authoritative.
    pub fn merge_latest(&mut self, next: NormalizedUsage) {
        if next.is_authoritative() {
            *self = next;
        }
    }

    pub fn from_anthropic(input_tokens: u64, output_tokens: u64, cache_read: u64, cache_write: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cache_read_input_tokens: cache_read,
            cache_write_input_tokens: cache_write,
        }
    }

    /// OpenAI's `usage.input_tokens_details.cached_tokens` maps to cache
    /// reads; OpenAI has no separate cache-write concept.
    pub fn from_openai(input_tokens: u64, output_tokens: u64, cached_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cache_read_input_tokens: cached_tokens,
            cache_write_input_tokens: 0,
        }
    }

    /// Gemini's `promptTokenCount` includes cached tokens; subtract them
    /// out so `input_tokens` means "newly charged input" like the other
    /// two platforms.
    pub fn from_gemini(prompt_token_count: u64, candidates_token_count: u64, cached_content_token_count: u64) -> Self {
        Self {
            input_tokens: prompt_token_count.saturating_sub(cached_content_token_count),
            output_tokens: candidates_token_count,
            cache_read_input_tokens: cached_content_token_count,
            cache_write_input_tokens: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_usage_excludes_cached_tokens_from_input() {
        let usage = NormalizedUsage::from_gemini(1000, 50, 400);
        assert_eq!(usage.input_tokens, 600);
        assert_eq!(usage.cache_read_input_tokens, 400);
    }

    #[test]
    fn merge_latest_ignores_non_authoritative_chunks() {
        let mut usage = NormalizedUsage::from_anthropic(100, 20, 0, 0);
        usage.merge_latest(NormalizedUsage::default());
        assert_eq!(usage.input_tokens, 100);

        usage.merge_latest(NormalizedUsage::from_anthropic(100, 35, 0, 0));
        assert_eq!(usage.output_tokens, 35);
    }

    #[test]
    fn zeroed_usage_is_not_authoritative() {
        assert!(!NormalizedUsage::default().is_authoritative());
        assert!(NormalizedUsage::from_openai(0, 1, 0).is_authoritative());
    }
}
