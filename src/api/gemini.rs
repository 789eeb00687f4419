//! `POST /v1beta/models/{model}:{action}` and `GET /v1beta/models` —
//! Gemini-native inbound. See SPEC_FULL.md §4.2 "Gemini native inbound →
//! Gemini upstream" and "countTokens local-estimator fallback".

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::error::{ErrorKind, GatewayError};
use crate::forwarding::engine::InboundProtocol;
use crate::forwarding::{engine::ForwardRequest, gemini};
use crate::model::Platform;
use crate::scheduler::{SelectionOutcome, SelectionRequest};

use super::routes::AppState;
use super::{auth, error_response, forward_response, session};

pub async fn generate(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let Some((model, action_str)) = model_action.split_once(':') else {
        return error_response::render(
            InboundProtocol::GeminiNative,
            &GatewayError::new(ErrorKind::InvalidRequest, "expected path shape {model}:{action}"),
        );
    };
    let action = match action_str {
        "generateContent" => gemini::GeminiAction::GenerateContent,
        "streamGenerateContent" => gemini::GeminiAction::StreamGenerateContent,
        "countTokens" => gemini::GeminiAction::CountTokens,
        other => {
            return error_response::render(
                InboundProtocol::GeminiNative,
                &GatewayError::new(ErrorKind::InvalidRequest, format!("unsupported action: {other}")),
            )
        }
    };

    let caller = match auth::authenticate(&state.config, &headers) {
        Ok(caller) => caller,
        Err(_) => return error_response::render(InboundProtocol::GeminiNative, &GatewayError::new(ErrorKind::Authentication, "invalid or missing api key")),
    };

    let stream = action == gemini::GeminiAction::StreamGenerateContent || query.get("alt").map(|v| v == "sse").unwrap_or(false);
    let session_hash = session::derive(&headers, &body);
    let user_agent = headers.get("user-agent").and_then(|v| v.to_str().ok()).unwrap_or_default().to_string();

    let request = ForwardRequest {
        group_id: caller.group_id,
        platform: Platform::Gemini,
        forced_platform: None,
        session_hash,
        model: model.to_string(),
        stream,
        inbound_protocol: InboundProtocol::GeminiNative,
        gemini_action: Some(action),
        body: body.clone(),
        user_agent,
        headers: headers.clone(),
    };

    match state.forwarding.forward(request).await {
        Ok(response) => forward_response::render(response),
        Err(err) if action == gemini::GeminiAction::CountTokens && err.kind == ErrorKind::Permission => {
            // OAuth token lacks the scope needed for a real countTokens
            // call; fall back to the local estimator rather than failing
            // the request outright.
            let text = extract_contents_text(&body);
            Json(json!({ "totalTokens": gemini::estimate_tokens(&text) })).into_response()
        }
        Err(err) => error_response::render(InboundProtocol::GeminiNative, &err),
    }
}

/// `GET /v1beta/models` — AI-Studio model listing, routed to whichever
/// AI-Studio-eligible account the scheduler picks for this group.
pub async fn list_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let caller = match auth::authenticate(&state.config, &headers) {
        Ok(caller) => caller,
        Err(_) => return error_response::render(InboundProtocol::GeminiNative, &GatewayError::new(ErrorKind::Authentication, "invalid or missing api key")),
    };

    let selection = state
        .scheduler
        .select_account(SelectionRequest {
            group_id: Some(caller.group_id),
            platform: Platform::Gemini,
            forced_platform: None,
            session_hash: None,
            requested_model: String::new(),
            exclusions: HashSet::new(),
            is_ai_studio_endpoint: true,
        })
        .await;

    let (account, _slot_guard) = match selection {
        Ok(SelectionOutcome::Selected(account, guard)) => (account, guard),
        Ok(SelectionOutcome::WaitPlan { .. }) | Err(_) => {
            return error_response::render(InboundProtocol::GeminiNative, &GatewayError::no_available_accounts())
        }
    };

    let mut request = state.http_client.get(format!("{}/v1beta/models", gemini::AI_STUDIO_BASE));
    if let Some(key) = &account.credentials.api_key {
        request = request.header("x-goog-api-key", key.clone());
    } else if let Some(token) = &account.credentials.access_token {
        request = request.header("authorization", format!("Bearer {token}"));
    }

    match request.send().await {
        Ok(resp) => {
            let status = resp.status();
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            (status, Json(body)).into_response()
        }
        Err(err) => error_response::render(
            InboundProtocol::GeminiNative,
            &GatewayError::new(ErrorKind::UpstreamError, format!("model listing request failed: {err}")),
        ),
    }
}

fn extract_contents_text(body: &Value) -> String {
    let mut text = String::new();
    let Some(contents) = body.get("contents").and_then(|v| v.as_array()) else {
        return text;
    };
    for content in contents {
        let Some(parts) = content.get("parts").and_then(|v| v.as_array()) else { continue };
        for part in parts {
            if let Some(part_text) = part.get("text").and_then(|v| v.as_str()) {
                text.push_str(part_text);
            }
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_text_across_all_parts() {
        let body = json!({
            "contents": [
                { "parts": [{ "text": "hello " }, { "text": "world" }] }
            ]
        });
        assert_eq!(extract_contents_text(&body), "hello world");
    }
}
