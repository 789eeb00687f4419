//! Per-platform rate-limit header and body parsing. See SPEC_FULL.md §4.3.
//!
//! Grounded in `api::proxy::parse_rate_limit_headers` /
//! `parse_duration_string`, generalized from "OpenAI-compatible vs.
//! Anthropic vs. everything-else" into the full per-platform table the
//! spec describes (Anthropic unified reset, OpenAI x-codex windows,
//! Gemini quota detail + PST-midnight daily reset).

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};

/// `anthropic-ratelimit-unified-reset`: RFC3339 instant.
pub fn parse_anthropic_unified_reset(headers: &HashMap<String, String>) -> Option<DateTime<Utc>> {
    headers
        .get("anthropic-ratelimit-unified-reset")
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone, Copy)]
pub struct CodexWindow {
    pub used_percent: f64,
    pub reset_after_seconds: u64,
}

/// `x-codex-primary-*` (5h) and `x-codex-secondary-*` (7d) windows. The
/// window whose `used_percent >= 100` drives the reset; if neither is
/// saturated, the longer window wins.
pub fn parse_openai_codex_windows(headers: &HashMap<String, String>) -> Option<DateTime<Utc>> {
    let primary = codex_window(headers, "primary");
    let secondary = codex_window(headers, "secondary");

    let now = Utc::now();
    match (primary, secondary) {
        (Some(p), _) if p.used_percent >= 100.0 => Some(now + chrono::Duration::seconds(p.reset_after_seconds as i64)),
        (_, Some(s)) if s.used_percent >= 100.0 => Some(now + chrono::Duration::seconds(s.reset_after_seconds as i64)),
        (Some(p), Some(s)) => {
            let longer = if p.reset_after_seconds >= s.reset_after_seconds { p } else { s };
            Some(now + chrono::Duration::seconds(longer.reset_after_seconds as i64))
        }
        (Some(p), None) => Some(now + chrono::Duration::seconds(p.reset_after_seconds as i64)),
        (None, Some(s)) => Some(now + chrono::Duration::seconds(s.reset_after_seconds as i64)),
        (None, None) => None,
    }
}

fn codex_window(headers: &HashMap<String, String>, name: &str) -> Option<CodexWindow> {
    let used_percent: f64 = headers.get(&format!("x-codex-{name}-used-percent"))?.parse().ok()?;
    let reset_after_seconds: u64 = headers.get(&format!("x-codex-{name}-reset-after-seconds"))?.parse().ok()?;
    Some(CodexWindow { used_percent, reset_after_seconds })
}

/// Body fallback: `error.type in {usage_limit_reached, rate_limit_exceeded}`
/// with `resets_at` (unix seconds) or `resets_in_seconds`.
pub fn parse_openai_body_reset(body: &serde_json::Value) -> Option<DateTime<Utc>> {
    let error = body.get("error")?;
    let error_type = error.get("type")?.as_str()?;
    if !matches!(error_type, "usage_limit_reached" | "rate_limit_exceeded") {
        return None;
    }
    if let Some(resets_at) = error.get("resets_at").and_then(|v| v.as_i64()) {
        return Utc.timestamp_opt(resets_at, 0).single();
    }
    if let Some(resets_in) = error.get("resets_in_seconds").and_then(|v| v.as_i64()) {
        return Some(Utc::now() + chrono::Duration::seconds(resets_in));
    }
    None
}

pub const OPENAI_FALLBACK_RESET: std::time::Duration = std::time::Duration::from_secs(300);

/// Gemini `error.details[].metadata.quotaResetDelay` (Go-style duration),
/// `"Please retry in Xs"` message text, or a `"per day"` daily reset
/// resolved to the next PST midnight.
pub fn parse_gemini_reset(body: &serde_json::Value) -> Option<DateTime<Utc>> {
    let message = body.get("error").and_then(|e| e.get("message")).and_then(|m| m.as_str()).unwrap_or("");

    if let Some(details) = body.get("error").and_then(|e| e.get("details")).and_then(|d| d.as_array()) {
        for detail in details {
            if let Some(delay) = detail.get("metadata").and_then(|m| m.get("quotaResetDelay")).and_then(|v| v.as_str()) {
                if let Some(secs) = parse_go_duration_seconds(delay) {
                    return Some(Utc::now() + chrono::Duration::seconds(secs));
                }
            }
        }
    }

    if message.to_lowercase().contains("per day") {
        return Some(next_pst_midnight(Utc::now()));
    }

    if let Some(secs) = parse_retry_in_seconds(message) {
        return Some(Utc::now() + chrono::Duration::seconds(secs));
    }

    None
}

fn parse_go_duration_seconds(input: &str) -> Option<i64> {
    let trimmed = input.trim();
    let numeric: String = trimmed.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
    let value: f64 = numeric.parse().ok()?;
    if trimmed.ends_with("ms") {
        Some((value / 1000.0).ceil() as i64)
    } else if trimmed.ends_with('s') {
        Some(value.ceil() as i64)
    } else if trimmed.ends_with('m') {
        Some((value * 60.0).ceil() as i64)
    } else {
        Some(value.ceil() as i64)
    }
}

fn parse_retry_in_seconds(message: &str) -> Option<i64> {
    let lower = message.to_lowercase();
    let marker = "please retry in ";
    let start = lower.find(marker)? + marker.len();
    let rest = &message[start..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Next midnight in America/Los_Angeles, approximated as a fixed UTC-8
/// offset (no DST table maintained here; within the minutes of slop this
/// rate-limit reset already tolerates).
fn next_pst_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    const PST_OFFSET_HOURS: i64 = 8;
    let pst_now = now - chrono::Duration::hours(PST_OFFSET_HOURS);
    let next_midnight_pst = (pst_now.date_naive() + chrono::Duration::days(1)).and_hms_opt(0, 0, 0).expect("valid midnight");
    DateTime::<Utc>::from_naive_utc_and_offset(next_midnight_pst, Utc) + chrono::Duration::hours(PST_OFFSET_HOURS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_openai_body_reset_from_resets_at() {
        let body = serde_json::json!({
            "error": { "type": "usage_limit_reached", "resets_at": 1769404154_i64 }
        });
        let reset = parse_openai_body_reset(&body).unwrap();
        assert_eq!(reset.timestamp(), 1769404154);
    }

    #[test]
    fn gemini_per_day_message_resolves_to_pst_midnight() {
        let body = serde_json::json!({ "error": { "message": "Quota exceeded, retry per day limit" } });
        let reset = parse_gemini_reset(&body).unwrap();
        assert!(reset > Utc::now());
    }

    #[test]
    fn gemini_quota_reset_delay_parses_go_duration() {
        let body = serde_json::json!({
            "error": { "message": "rate limited", "details": [
                { "metadata": { "quotaResetDelay": "30s" } }
            ]}
        });
        let reset = parse_gemini_reset(&body).unwrap();
        let diff = (reset - Utc::now()).num_seconds();
        assert!((28..=32).contains(&diff));
    }

    #[test]
    fn codex_window_prefers_saturated_window() {
        let mut headers = HashMap::new();
        headers.insert("x-codex-primary-used-percent".to_string(), "100".to_string());
        headers.insert("x-codex-primary-reset-after-seconds".to_string(), "120".to_string());
        headers.insert("x-codex-secondary-used-percent".to_string(), "40".to_string());
        headers.insert("x-codex-secondary-reset-after-seconds".to_string(), "604800".to_string());

        let reset = parse_openai_codex_windows(&headers).unwrap();
        let diff = (reset - Utc::now()).num_seconds();
        assert!((110..=125).contains(&diff));
    }
}
