//! Sticky-session hash derivation. See SPEC_FULL.md §9 Open Questions:
//! computed from caller-supplied headers with a body fallback; absent
//! all three, the call is treated as having no session (no implicit
//! stickiness from IP/UA).

use axum::http::HeaderMap;
use serde_json::Value;

const HEADER_CANDIDATES: &[&str] = &["session_id", "conversation_id"];

pub fn derive(headers: &HeaderMap, body: &Value) -> Option<String> {
    for name in HEADER_CANDIDATES {
        if let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    body.get("prompt_cache_key")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn prefers_session_id_header() {
        let mut headers = HeaderMap::new();
        headers.insert("session_id", HeaderValue::from_static("sess-1"));
        assert_eq!(derive(&headers, &json!({})), Some("sess-1".to_string()));
    }

    #[test]
    fn falls_back_to_prompt_cache_key() {
        let headers = HeaderMap::new();
        let body = json!({ "prompt_cache_key": "cache-1" });
        assert_eq!(derive(&headers, &body), Some("cache-1".to_string()));
    }

    #[test]
    fn no_implicit_stickiness_when_all_absent() {
        assert_eq!(derive(&HeaderMap::new(), &json!({})), None);
    }
}
