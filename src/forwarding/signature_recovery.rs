//! Signature recovery for Gemini-upstream 400s. See SPEC_FULL.md §4.2
//! "Signature recovery".
//!
//! On a Gemini 400 whose body complains about a missing/invalid thought
//! signature, a two-stage retry rewrites the inbound (Anthropic-shaped)
//! body: stage 1 strips `thinking` blocks and disables further thinking;
//! stage 2 additionally downgrades `tool_use`/`tool_result` blocks to
//! plain text. Each stage consumes one retry from the forwarding budget.

use serde_json::{json, Value};

/// Whether an upstream 400 body matches the signature-error shape this
/// recovery targets.
pub fn is_signature_error(body: &Value) -> bool {
    let message = body
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .unwrap_or("");
    message.contains("thought_signature") || message.contains("signature")
}

/// Stage 1: strip `thinking` content blocks from every message and set
/// `thinking: { type: "disabled" }` so the model does not emit new ones.
pub fn strip_thinking_blocks(body: &Value) -> Value {
    let mut out = body.clone();
    if let Some(messages) = out.get_mut("messages").and_then(|v| v.as_array_mut()) {
        for message in messages.iter_mut() {
            if let Some(content) = message.get_mut("content").and_then(|v| v.as_array_mut()) {
                content.retain(|block| block.get("type").and_then(|t| t.as_str()) != Some("thinking"));
            }
        }
    }
    if let Some(obj) = out.as_object_mut() {
        obj.insert("thinking".to_string(), json!({ "type": "disabled" }));
    }
    out
}

/// Stage 2: additionally downgrade `tool_use` / `tool_result` blocks to
/// plain text blocks, so a model with no tool-calling context left can
/// still be retried once more before falling through to a mapped error.
pub fn downgrade_tool_blocks(body: &Value) -> Value {
    let mut out = strip_thinking_blocks(body);
    if let Some(messages) = out.get_mut("messages").and_then(|v| v.as_array_mut()) {
        for message in messages.iter_mut() {
            if let Some(content) = message.get_mut("content").and_then(|v| v.as_array_mut()) {
                for block in content.iter_mut() {
                    let kind = block.get("type").and_then(|t| t.as_str());
                    match kind {
                        Some("tool_use") => {
                            let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("tool");
                            let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                            *block = json!({ "type": "text", "text": format!("[tool call: {name} {input}]") });
                        }
                        Some("tool_result") => {
                            let text = match block.get("content") {
                                Some(Value::String(s)) => s.clone(),
                                _ => String::new(),
                            };
                            *block = json!({ "type": "text", "text": format!("[tool result: {text}]") });
                        }
                        _ => {}
                    }
                }
            }
        }
    }
    out
}

/// Drive the two-stage rewrite given the current recovery stage (0 = none
/// attempted yet). Returns `None` once both stages have been exhausted,
/// meaning the third matching 400 should proceed as a normal mapped error.
pub fn next_stage_body(body: &Value, current_stage: u8) -> Option<(u8, Value)> {
    match current_stage {
        0 => Some((1, strip_thinking_blocks(body))),
        1 => Some((2, downgrade_tool_blocks(body))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_thought_signature_error_message() {
        let body = json!({ "error": { "message": "Invalid thought_signature for part" } });
        assert!(is_signature_error(&body));
        assert!(!is_signature_error(&json!({ "error": { "message": "rate limited" } })));
    }

    #[test]
    fn stage_progression_exhausts_after_two_stages() {
        let body = json!({ "messages": [] });
        let (stage1, _) = next_stage_body(&body, 0).unwrap();
        assert_eq!(stage1, 1);
        let (stage2, _) = next_stage_body(&body, 1).unwrap();
        assert_eq!(stage2, 2);
        assert!(next_stage_body(&body, 2).is_none());
    }

    #[test]
    fn stage_one_removes_thinking_blocks() {
        let body = json!({ "messages": [{ "role": "assistant", "content": [
            { "type": "thinking", "thinking": "..." },
            { "type": "text", "text": "hi" }
        ]}]});
        let rewritten = strip_thinking_blocks(&body);
        let content = rewritten["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0]["type"], "text");
        assert_eq!(rewritten["thinking"]["type"], "disabled");
    }

    #[test]
    fn stage_two_downgrades_tool_blocks_to_text() {
        let body = json!({ "messages": [{ "role": "assistant", "content": [
            { "type": "tool_use", "name": "f", "input": {} }
        ]}]});
        let rewritten = downgrade_tool_blocks(&body);
        let content = rewritten["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "text");
    }
}
