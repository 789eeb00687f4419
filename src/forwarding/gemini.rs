//! Gemini-shaped upstream routing, aggregation, and status mapping. See
//! SPEC_FULL.md §4.2 "Gemini native inbound → Gemini upstream" and §6
//! "Gemini status ↔ Anthropic kind mapping".
//!
//! Endpoint selection and the Code-Assist wrapper shape are grounded in
//! `api::proxy::build_google_upstream_request` / `resolve_google_project`;
//! this module generalizes them into the full OAuth-with-project vs.
//! OAuth-without-project vs. AI-Studio decision table and adds the
//! stream-aggregation and local token estimator the spec requires.

use serde_json::{json, Value};

use crate::error::ErrorKind;
use crate::model::Credentials;
use crate::usage::NormalizedUsage;

pub const CODE_ASSIST_BASE: &str = "https://cloudcode-pa.googleapis.com";
pub const AI_STUDIO_BASE: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeminiAction {
    GenerateContent,
    StreamGenerateContent,
    CountTokens,
}

impl GeminiAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeminiAction::GenerateContent => "generateContent",
            GeminiAction::StreamGenerateContent => "streamGenerateContent",
            GeminiAction::CountTokens => "countTokens",
        }
    }
}

#[derive(Debug, Clone)]
pub enum GeminiRoute {
    /// OAuth account with a `project_id`: wrapped `{model, project, request}`
    /// sent to the internal Code-Assist endpoint.
    CodeAssist { url: String, wrapped_body: Value },
    /// OAuth account without a `project_id`, or an api-key account: sent
    /// to the public AI-Studio endpoint with a Bearer token / key.
    AiStudio { url: String },
}

/// Decide the upstream URL/body shape for one Gemini-shaped call. OAuth
/// non-streaming `generateContent` is unreliable (see `aggregate_stream`),
/// so the caller always requests `streamGenerateContent` upstream and
/// downgrades to non-streaming only after aggregating.
pub fn route_request(credentials: &Credentials, model: &str, action: GeminiAction, body: &Value) -> GeminiRoute {
    match (&credentials.project_id, &credentials.access_token) {
        (Some(project_id), Some(_)) => {
            let wrapped = json!({ "model": model, "project": project_id, "request": body });
            GeminiRoute::CodeAssist {
                url: format!("{CODE_ASSIST_BASE}/v1internal:{}", action.as_str()),
                wrapped_body: wrapped,
            }
        }
        _ => GeminiRoute::AiStudio {
            url: format!("{AI_STUDIO_BASE}/v1beta/models/{model}:{}", action.as_str()),
        },
    }
}

/// One chunk of an upstream `streamGenerateContent` response.
#[derive(Debug, Clone, Default)]
pub struct AggregatedResponse {
    pub text: String,
    pub finish_reason: Option<String>,
    pub usage: Option<NormalizedUsage>,
    pub parts: Vec<Value>,
}

/// Concatenate `text` parts across chunks in order, keep the last
/// `finishReason`, and let the last `usageMetadata` win. Used to turn a
/// forced-streaming upstream call back into one non-streaming response.
pub fn aggregate_stream_chunks(chunks: &[Value]) -> AggregatedResponse {
    let mut aggregated = AggregatedResponse::default();
    for chunk in chunks {
        let Some(candidate) = chunk.get("candidates").and_then(|v| v.as_array()).and_then(|c| c.first()) else {
            continue;
        };
        if let Some(parts) = candidate.get("content").and_then(|c| c.get("parts")).and_then(|p| p.as_array()) {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                    aggregated.text.push_str(text);
                }
                aggregated.parts.push(part.clone());
            }
        }
        if let Some(reason) = candidate.get("finishReason").and_then(|v| v.as_str()) {
            aggregated.finish_reason = Some(reason.to_string());
        }
        if let Some(usage_meta) = chunk.get("usageMetadata") {
            let prompt = usage_meta.get("promptTokenCount").and_then(|v| v.as_u64()).unwrap_or(0);
            let candidates_tok = usage_meta.get("candidatesTokenCount").and_then(|v| v.as_u64()).unwrap_or(0);
            let cached = usage_meta.get("cachedContentTokenCount").and_then(|v| v.as_u64()).unwrap_or(0);
            aggregated.usage = Some(NormalizedUsage::from_gemini(prompt, candidates_tok, cached));
        }
    }
    aggregated
}

/// Local token estimator used when `countTokens` is requested on an OAuth
/// token with insufficient scopes: ASCII ≈ 4 chars/token, non-ASCII ≈ 1
/// rune/token.
pub fn estimate_tokens(text: &str) -> u64 {
    let mut ascii_chars: u64 = 0;
    let mut non_ascii_runes: u64 = 0;
    for ch in text.chars() {
        if ch.is_ascii() {
            ascii_chars += 1;
        } else {
            non_ascii_runes += 1;
        }
    }
    (ascii_chars as f64 / 4.0).ceil() as u64 + non_ascii_runes
}

/// `INVALID_ARGUMENT → invalid_request_error`, etc. See SPEC_FULL.md §6.
pub fn status_to_error_kind(google_status: &str) -> ErrorKind {
    match google_status {
        "INVALID_ARGUMENT" => ErrorKind::InvalidRequest,
        "PERMISSION_DENIED" => ErrorKind::Permission,
        "NOT_FOUND" => ErrorKind::NotFound,
        "RESOURCE_EXHAUSTED" => ErrorKind::RateLimit,
        "UNAUTHENTICATED" => ErrorKind::Authentication,
        "UNAVAILABLE" => ErrorKind::Overloaded,
        "INTERNAL" => ErrorKind::ApiError,
        "DEADLINE_EXCEEDED" => ErrorKind::Timeout,
        _ => ErrorKind::UpstreamError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_with_project_routes_to_code_assist() {
        let creds = Credentials { access_token: Some("t".into()), project_id: Some("p".into()), ..Default::default() };
        match route_request(&creds, "gemini-2.5-pro", GeminiAction::GenerateContent, &json!({})) {
            GeminiRoute::CodeAssist { url, .. } => assert!(url.contains("v1internal")),
            _ => panic!("expected code assist route"),
        }
    }

    #[test]
    fn oauth_without_project_routes_to_ai_studio() {
        let creds = Credentials { access_token: Some("t".into()), ..Default::default() };
        match route_request(&creds, "gemini-2.5-pro", GeminiAction::GenerateContent, &json!({})) {
            GeminiRoute::AiStudio { url } => assert!(url.contains("generativelanguage")),
            _ => panic!("expected ai studio route"),
        }
    }

    #[test]
    fn aggregation_concatenates_text_and_keeps_last_finish_reason_and_usage() {
        let chunks = vec![
            json!({ "candidates": [{ "content": { "parts": [{ "text": "Hel" }] }, "finishReason": null }] }),
            json!({
                "candidates": [{ "content": { "parts": [{ "text": "lo" }] }, "finishReason": "STOP" }],
                "usageMetadata": { "promptTokenCount": 100, "candidatesTokenCount": 5, "cachedContentTokenCount": 20 }
            }),
        ];
        let aggregated = aggregate_stream_chunks(&chunks);
        assert_eq!(aggregated.text, "Hello");
        assert_eq!(aggregated.finish_reason.as_deref(), Some("STOP"));
        let usage = aggregated.usage.unwrap();
        assert_eq!(usage.input_tokens, 80);
        assert_eq!(usage.output_tokens, 5);
    }

    #[test]
    fn token_estimate_counts_ascii_and_non_ascii_differently() {
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("\u{4f60}\u{597d}"), 2);
    }

    #[test]
    fn status_mapping_matches_spec_table() {
        assert_eq!(status_to_error_kind("RESOURCE_EXHAUSTED"), ErrorKind::RateLimit);
        assert_eq!(status_to_error_kind("UNAVAILABLE"), ErrorKind::Overloaded);
        assert_eq!(status_to_error_kind("WEIRD_UNKNOWN"), ErrorKind::UpstreamError);
    }
}
