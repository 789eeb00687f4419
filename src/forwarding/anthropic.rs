//! Anthropic-shaped inbound conversions. See SPEC_FULL.md §4.2.
//!
//! The Anthropic→Anthropic upstream path is a near-identity forward (the
//! engine only rewrites source-only fields before sending); the
//! Anthropic→Gemini path is adapted from `api::proxy::build_google_upstream_request`,
//! generalized from OpenAI `messages` to Anthropic `messages` + top-level
//! `system`.

use serde_json::{json, Map, Value};

use crate::usage::NormalizedUsage;

/// Sentinel used when the caller's tool_use/tool_result block carries no
/// `thoughtSignature` of its own; Gemini requires a non-empty one.
pub const SENTINEL_THOUGHT_SIGNATURE: &str = "skip_thought_signature_validator";

/// Convert an Anthropic-shaped request body into a Gemini `generateContent`
/// request body (`contents` + optional `systemInstruction` + `tools`).
pub fn anthropic_to_gemini_request(body: &Value) -> Value {
    let mut contents = Vec::new();

    if let Some(messages) = body.get("messages").and_then(|v| v.as_array()) {
        for message in messages {
            let role = message.get("role").and_then(|v| v.as_str()).unwrap_or("user");
            let gemini_role = if role == "assistant" { "model" } else { "user" };
            let parts = anthropic_content_to_gemini_parts(message.get("content"));
            if parts.is_empty() {
                continue;
            }
            contents.push(json!({ "role": gemini_role, "parts": parts }));
        }
    }

    let mut request = Map::new();
    request.insert("contents".to_string(), Value::Array(contents));

    if let Some(system) = body.get("system") {
        let text = match system {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        };
        if !text.is_empty() {
            request.insert("systemInstruction".to_string(), json!({ "parts": [{ "text": text }] }));
        }
    }

    if let Some(tools) = body.get("tools").and_then(|v| v.as_array()) {
        let decls: Vec<Value> = tools
            .iter()
            .filter_map(|tool| {
                let name = tool.get("name").and_then(|v| v.as_str())?;
                let mut decl = Map::new();
                decl.insert("name".to_string(), json!(name));
                if let Some(desc) = tool.get("description").and_then(|v| v.as_str()) {
                    decl.insert("description".to_string(), json!(desc));
                }
                if let Some(schema) = tool.get("input_schema") {
                    decl.insert("parameters".to_string(), clean_json_schema(schema));
                }
                Some(Value::Object(decl))
            })
            .collect();
        if !decls.is_empty() {
            request.insert("tools".to_string(), json!([{ "functionDeclarations": decls }]));
        }
    }

    if let Some(max_tokens) = body.get("max_tokens").and_then(|v| v.as_u64()) {
        request.insert("generationConfig".to_string(), json!({ "maxOutputTokens": max_tokens }));
    }

    Value::Object(request)
}

fn anthropic_content_to_gemini_parts(content: Option<&Value>) -> Vec<Value> {
    let Some(content) = content else { return Vec::new() };
    match content {
        Value::String(s) => vec![json!({ "text": s })],
        Value::Array(blocks) => blocks.iter().filter_map(anthropic_block_to_gemini_part).collect(),
        _ => Vec::new(),
    }
}

fn anthropic_block_to_gemini_part(block: &Value) -> Option<Value> {
    match block.get("type").and_then(|v| v.as_str())? {
        "text" => Some(json!({ "text": block.get("text").and_then(|v| v.as_str()).unwrap_or("") })),
        "image" => {
            let source = block.get("source")?;
            let media_type = source.get("media_type").and_then(|v| v.as_str()).unwrap_or("image/png");
            let data = source.get("data").and_then(|v| v.as_str()).unwrap_or("");
            Some(json!({ "inlineData": { "mimeType": media_type, "data": data } }))
        }
        "tool_use" => {
            let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("tool");
            let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
            let signature = block
                .get("thought_signature")
                .or_else(|| block.get("thoughtSignature"))
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .unwrap_or(SENTINEL_THOUGHT_SIGNATURE);
            Some(json!({
                "functionCall": { "name": name, "args": input },
                "thoughtSignature": signature,
            }))
        }
        "tool_result" => {
            let name = block.get("tool_use_id").and_then(|v| v.as_str()).unwrap_or("tool");
            let output = match block.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Array(parts)) => parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n"),
                _ => String::new(),
            };
            Some(json!({ "functionResponse": { "name": name, "response": { "output": output } } }))
        }
        _ => None,
    }
}

/// Strip fields the Gemini upstream rejects and normalize JSON Schema
/// types to upper case, per SPEC_FULL.md §4.2 "Anthropic-shaped inbound →
/// Gemini upstream".
pub fn clean_json_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut cleaned = Map::new();
            for (key, value) in map {
                match key.as_str() {
                    "$schema" | "$id" | "$ref" | "additionalProperties" | "minLength" | "maxLength" | "minItems" | "maxItems" => continue,
                    "type" => {
                        if let Value::String(t) = value {
                            cleaned.insert(key.clone(), Value::String(t.to_uppercase()));
                        } else {
                            cleaned.insert(key.clone(), clean_json_schema(value));
                        }
                    }
                    _ => {
                        cleaned.insert(key.clone(), clean_json_schema(value));
                    }
                }
            }
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.iter().map(clean_json_schema).collect()),
        other => other.clone(),
    }
}

/// Convert an aggregated Gemini response back into an Anthropic-shaped
/// `content` array, the reverse of `anthropic_to_gemini_request`'s part
/// mapping (round-trips text, tool_use↔functionCall, image↔inlineData).
pub fn gemini_parts_to_anthropic_content(parts: &[Value]) -> Vec<Value> {
    parts
        .iter()
        .filter_map(|part| {
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                return Some(json!({ "type": "text", "text": text }));
            }
            if let Some(fc) = part.get("functionCall") {
                let name = fc.get("name").and_then(|v| v.as_str()).unwrap_or("tool");
                let input = fc.get("args").cloned().unwrap_or_else(|| json!({}));
                let mut block = json!({
                    "type": "tool_use",
                    "id": format!("toolu_{}", uuid::Uuid::new_v4().simple()),
                    "name": name,
                    "input": input,
                });
                if let Some(sig) = part.get("thoughtSignature").and_then(|v| v.as_str()) {
                    block["thought_signature"] = json!(sig);
                }
                return Some(block);
            }
            if let Some(inline) = part.get("inlineData") {
                let mime = inline.get("mimeType").and_then(|v| v.as_str()).unwrap_or("image/png");
                let data = inline.get("data").and_then(|v| v.as_str()).unwrap_or("");
                return Some(json!({
                    "type": "image",
                    "source": { "type": "base64", "media_type": mime, "data": data },
                }));
            }
            None
        })
        .collect()
}

/// Usage extraction from the Anthropic `message_start` / `message_delta`
/// SSE event bodies.
pub fn usage_from_message_start(event_data: &Value) -> Option<NormalizedUsage> {
    let usage = event_data.get("message")?.get("usage")?;
    Some(NormalizedUsage::from_anthropic(
        usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        usage.get("cache_read_input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        usage.get("cache_creation_input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
    ))
}

pub fn usage_from_message_delta(event_data: &Value) -> Option<NormalizedUsage> {
    let usage = event_data.get("usage")?;
    Some(NormalizedUsage::from_anthropic(
        usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        usage.get("cache_read_input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        usage.get("cache_creation_input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_use_round_trips_through_gemini_shape() {
        let anthropic_msg = json!([{ "type": "tool_use", "name": "get_weather", "input": { "city": "nyc" } }]);
        let parts = anthropic_content_to_gemini_parts(Some(&anthropic_msg));
        let back = gemini_parts_to_anthropic_content(&parts);
        assert_eq!(back[0]["type"], "tool_use");
        assert_eq!(back[0]["name"], "get_weather");
        assert_eq!(back[0]["input"]["city"], "nyc");
    }

    #[test]
    fn tool_use_without_signature_gets_sentinel() {
        let anthropic_msg = json!([{ "type": "tool_use", "name": "f", "input": {} }]);
        let parts = anthropic_content_to_gemini_parts(Some(&anthropic_msg));
        assert_eq!(parts[0]["thoughtSignature"], SENTINEL_THOUGHT_SIGNATURE);
    }

    #[test]
    fn image_round_trips_to_inline_data_and_back() {
        let anthropic_msg = json!([{ "type": "image", "source": { "type": "base64", "media_type": "image/png", "data": "abc" } }]);
        let parts = anthropic_content_to_gemini_parts(Some(&anthropic_msg));
        assert_eq!(parts[0]["inlineData"]["mimeType"], "image/png");
        let back = gemini_parts_to_anthropic_content(&parts);
        assert_eq!(back[0]["type"], "image");
        assert_eq!(back[0]["source"]["data"], "abc");
    }

    #[test]
    fn schema_cleanup_strips_disallowed_keys_and_upcases_type() {
        let schema = json!({
            "type": "object",
            "$schema": "http://json-schema.org/draft-07/schema#",
            "additionalProperties": false,
            "properties": { "x": { "type": "string", "minLength": 1 } }
        });
        let cleaned = clean_json_schema(&schema);
        assert_eq!(cleaned["type"], "OBJECT");
        assert!(cleaned.get("$schema").is_none());
        assert!(cleaned.get("additionalProperties").is_none());
        assert_eq!(cleaned["properties"]["x"]["type"], "STRING");
        assert!(cleaned["properties"]["x"].get("minLength").is_none());
    }

    #[test]
    fn message_start_usage_extracts_all_four_fields() {
        let event = json!({
            "message": { "usage": { "input_tokens": 10, "output_tokens": 0, "cache_read_input_tokens": 3, "cache_creation_input_tokens": 2 } }
        });
        let usage = usage_from_message_start(&event).unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.cache_read_input_tokens, 3);
        assert_eq!(usage.cache_write_input_tokens, 2);
    }
}
