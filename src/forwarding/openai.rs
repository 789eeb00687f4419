//! OpenAI-shaped inbound conversions. See SPEC_FULL.md §4.2.
//!
//! The passthrough path (OAuth with `openai_passthrough=true`) forwards
//! the body byte-identical; this module only covers the legacy transform
//! applied otherwise, adapted from `api::proxy`'s SSE model-substitution
//! pattern (`normalize_sse_line`) generalized into a JSON-structural
//! top-level-field replace instead of a substring replace.

use serde_json::{Map, Value};

/// `store=true → false`, `stream=false → true` (OAuth returns empty
/// non-streaming bodies), `instructions` synthesized when empty for
/// Codex-CLI user agents or overridden otherwise, tool specs normalized,
/// `input` items lose `id` unless this is a continuation.
pub fn apply_legacy_transform(body: &Value, user_agent: &str, override_instructions: Option<&str>) -> Value {
    let mut value = body.clone();
    let Some(obj) = value.as_object_mut() else { return value };

    obj.insert("store".to_string(), Value::Bool(false));
    obj.insert("stream".to_string(), Value::Bool(true));

    let instructions_empty = obj.get("instructions").and_then(|v| v.as_str()).unwrap_or("").is_empty();
    if let Some(custom) = override_instructions {
        obj.insert("instructions".to_string(), Value::String(custom.to_string()));
    } else if instructions_empty && user_agent.to_lowercase().contains("codex") {
        obj.insert("instructions".to_string(), Value::String(default_codex_cli_instructions()));
    }

    if let Some(tools) = obj.get_mut("tools").and_then(|v| v.as_array_mut()) {
        for tool in tools.iter_mut() {
            normalize_tool_spec(tool);
        }
    }

    let continuation = is_continuation(&value);
    if let Some(input) = obj.get_mut("input").and_then(|v| v.as_array_mut()) {
        if !continuation {
            for item in input.iter_mut() {
                if let Some(item_obj) = item.as_object_mut() {
                    item_obj.remove("id");
                }
            }
        }
    }

    value
}

fn default_codex_cli_instructions() -> String {
    "You are Codex, a coding agent running in the Codex CLI.".to_string()
}

fn normalize_tool_spec(tool: &mut Value) {
    let Some(obj) = tool.as_object_mut() else { return };
    if obj.get("type").is_none() {
        obj.insert("type".to_string(), Value::String("function".to_string()));
    }
}

/// `input` items carrying `item_reference` or `function_call_output`
/// mark the request as a continuation, which keeps item ids intact.
pub fn is_continuation(body: &Value) -> bool {
    body.get("input")
        .and_then(|v| v.as_array())
        .is_some_and(|items| {
            items.iter().any(|item| {
                item.get("type").and_then(|v| v.as_str()) == Some("item_reference")
                    || item.get("type").and_then(|v| v.as_str()) == Some("function_call_output")
            })
        })
}

/// JSON-structural replace of top-level `model` (and `response.model`),
/// never a substring replace, so a model id that is a prefix of another
/// (or embedded in free text) is never corrupted.
pub fn rewrite_model_field(body: &mut Value, alias: &str) {
    if let Some(obj) = body.as_object_mut() {
        if obj.contains_key("model") {
            obj.insert("model".to_string(), Value::String(alias.to_string()));
        }
        if let Some(response) = obj.get_mut("response").and_then(|v| v.as_object_mut()) {
            if response.contains_key("model") {
                response.insert("model".to_string(), Value::String(alias.to_string()));
            }
        }
    }
}

/// Headers stripped before an OAuth-passthrough request reaches
/// `chatgpt.com`. See SPEC_FULL.md §6.
pub const PASSTHROUGH_STRIPPED_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "x-api-key",
    "x-goog-api-key",
    "accept-encoding",
    "proxy-authorization",
];

pub fn passthrough_headers_to_strip(headers: &Map<String, Value>) -> Vec<String> {
    headers
        .keys()
        .filter(|k| PASSTHROUGH_STRIPPED_HEADERS.contains(&k.to_lowercase().as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn legacy_transform_forces_store_false_and_stream_true() {
        let body = json!({ "store": true, "stream": false, "model": "gpt-5" });
        let transformed = apply_legacy_transform(&body, "curl/8.0", None);
        assert_eq!(transformed["store"], false);
        assert_eq!(transformed["stream"], true);
    }

    #[test]
    fn codex_cli_user_agent_synthesizes_instructions_when_empty() {
        let body = json!({ "input": [] });
        let transformed = apply_legacy_transform(&body, "codex-cli/1.0", None);
        assert!(transformed["instructions"].as_str().unwrap().contains("Codex"));
    }

    #[test]
    fn continuation_items_keep_their_id() {
        let body = json!({ "input": [
            { "type": "item_reference", "id": "keep-me" },
            { "type": "message", "id": "drop-me", "role": "user" }
        ]});
        let transformed = apply_legacy_transform(&body, "curl", None);
        let input = transformed["input"].as_array().unwrap();
        assert_eq!(input[0]["id"], "keep-me");
        assert_eq!(input[1]["id"], "drop-me");
    }

    #[test]
    fn non_continuation_input_items_lose_id() {
        let body = json!({ "input": [ { "type": "message", "id": "drop-me", "role": "user" } ] });
        let transformed = apply_legacy_transform(&body, "curl", None);
        assert!(transformed["input"][0].get("id").is_none());
    }

    #[test]
    fn model_rewrite_is_structural_not_substring() {
        let mut body = json!({ "model": "gpt-5", "response": { "model": "gpt-5", "text": "mentions gpt-5 here too" } });
        rewrite_model_field(&mut body, "gpt-5-aliased");
        assert_eq!(body["model"], "gpt-5-aliased");
        assert_eq!(body["response"]["model"], "gpt-5-aliased");
        assert_eq!(body["response"]["text"], "mentions gpt-5 here too");
    }
}
