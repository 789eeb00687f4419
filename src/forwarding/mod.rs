//! Forwarding Engine. See SPEC_FULL.md §4.2.
//!
//! Generalizes `api::proxy`'s chain-walking OpenAI-compatible forwarder
//! (backoff loop, SSE line rewriting, Google Code-Assist request building)
//! into the full per-platform skeleton: build → send → classify → retry /
//! failover / fatal, shared across all inbound/upstream protocol pairings.

pub mod anthropic;
pub mod engine;
pub mod gemini;
pub mod openai;
pub mod signature_recovery;
pub mod stream_relay;

use std::time::Duration;

use rand::Rng;

use crate::error::{ErrorKind, GatewayError};
use crate::usage::NormalizedUsage;

/// 5 attempts, exponential backoff base 1s capped at 16s, ±20% jitter.
pub const MAX_RETRY_ATTEMPTS: u32 = 5;
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_CAP: Duration = Duration::from_secs(16);

/// `429, 500, 502, 503, 504, 529` are retriable everywhere; `403` is
/// retriable only for Code Assist OAuth (quota propagation on that one
/// upstream), so that case is threaded through separately by the Gemini
/// attempt loop rather than folded into this general table.
pub fn is_retriable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

/// Exponential backoff with full jitter, capped at `BACKOFF_CAP`.
/// `attempt` is zero-based (0 = delay before the first retry).
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    let base = BACKOFF_BASE.as_secs_f64() * 2f64.powi(attempt as i32);
    let capped = base.min(BACKOFF_CAP.as_secs_f64());
    let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
    let jittered = (capped * (1.0 + jitter_frac)).max(0.0);
    Duration::from_secs_f64(jittered)
}

/// What the per-attempt skeleton decided to do with a non-2xx response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptDecision {
    Retry,
    Failover,
    Fatal,
}

/// Classify one upstream response per SPEC_FULL.md §4.2 "Retry budget" /
/// "Failover vs fatal". `attempts_used` excludes the current one.
pub fn classify_attempt(
    status: u16,
    attempts_used: u32,
    is_code_assist_oauth: bool,
    signature_recovery_eligible: bool,
) -> AttemptDecision {
    let retriable = is_retriable_status(status) || (status == 403 && is_code_assist_oauth) || signature_recovery_eligible;
    if retriable && attempts_used < MAX_RETRY_ATTEMPTS {
        return AttemptDecision::Retry;
    }
    if matches!(status, 401 | 403 | 429 | 529) || status >= 500 {
        return AttemptDecision::Failover;
    }
    AttemptDecision::Fatal
}

/// `context cancelled` / `deadline_exceeded` short-circuit the retry loop
/// entirely rather than consuming a budget slot.
pub fn is_cancellation(err: &GatewayError) -> bool {
    matches!(err.kind, ErrorKind::Timeout) && err.message.contains("cancelled")
}

/// Result contract returned by a completed forwarding attempt. See
/// SPEC_FULL.md §4.2 "Result contract".
#[derive(Debug, Clone)]
pub struct ForwardResult {
    pub request_id: String,
    pub usage: NormalizedUsage,
    pub model: String,
    pub stream: bool,
    pub duration: Duration,
    pub first_token_ms: Option<u64>,
    pub image_count: u32,
    pub image_size_bytes: u64,
}

/// Per-request state threaded across retries/failovers of one inbound
/// call. A fresh HTTP request is built from `original_body` on every
/// attempt so retries can be idempotently rewritten mid-stream (signature
/// recovery mutates `rewritten_body`).
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub original_body: serde_json::Value,
    pub rewritten_body: serde_json::Value,
    pub attempts_used: u32,
    pub signature_recovery_stage: u8,
}

impl AttemptContext {
    pub fn new(body: serde_json::Value) -> Self {
        Self { original_body: body.clone(), rewritten_body: body, attempts_used: 0, signature_recovery_stage: 0 }
    }
}

/// Streaming watchdog configuration (SPEC_FULL.md §4.2 "Timing").
#[derive(Debug, Clone, Copy)]
pub struct StreamWatchdogConfig {
    pub data_interval_timeout: Duration,
    pub keepalive_interval: Option<Duration>,
    pub max_line_size: usize,
}

impl Default for StreamWatchdogConfig {
    fn default() -> Self {
        Self {
            data_interval_timeout: Duration::from_secs(30),
            keepalive_interval: Some(Duration::from_secs(15)),
            max_line_size: 1 << 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped_and_jittered_within_bounds() {
        for attempt in 0..10 {
            let d = backoff_for_attempt(attempt);
            assert!(d.as_secs_f64() <= BACKOFF_CAP.as_secs_f64() * 1.2 + 0.001);
        }
    }

    #[test]
    fn retriable_statuses_match_spec_table() {
        for code in [429, 500, 502, 503, 504, 529] {
            assert!(is_retriable_status(code), "{code} should be retriable");
        }
        assert!(!is_retriable_status(400));
        assert!(!is_retriable_status(404));
    }

    #[test]
    fn exhausted_retry_budget_falls_back_to_failover_or_fatal() {
        assert_eq!(classify_attempt(429, MAX_RETRY_ATTEMPTS, false, false), AttemptDecision::Failover);
        assert_eq!(classify_attempt(400, MAX_RETRY_ATTEMPTS, false, false), AttemptDecision::Fatal);
    }

    #[test]
    fn code_assist_403_is_retriable_only_for_oauth() {
        assert_eq!(classify_attempt(403, 0, true, false), AttemptDecision::Retry);
        assert_eq!(classify_attempt(403, 0, false, false), AttemptDecision::Failover);
    }

    #[test]
    fn fatal_statuses_never_retry_or_failover() {
        assert_eq!(classify_attempt(404, 0, false, false), AttemptDecision::Fatal);
        assert_eq!(classify_attempt(422, 0, false, false), AttemptDecision::Fatal);
    }
}
