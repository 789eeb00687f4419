//! `POST /v1/messages` — Anthropic-shaped inbound. See SPEC_FULL.md §4.2
//! "Anthropic inbound → Anthropic upstream" / "Anthropic inbound →
//! Gemini upstream".

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde_json::Value;

use crate::error::{ErrorKind, GatewayError};
use crate::forwarding::engine::{ForwardRequest, InboundProtocol};
use crate::model::Platform;

use super::routes::AppState;
use super::{auth, error_response, forward_response, session};

pub async fn messages(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let caller = match auth::authenticate(&state.config, &headers) {
        Ok(caller) => caller,
        Err(_) => return error_response::render(InboundProtocol::Anthropic, &GatewayError::new(ErrorKind::Authentication, "invalid or missing api key")),
    };

    let model = body.get("model").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    let session_hash = session::derive(&headers, &body);
    let user_agent = headers.get("user-agent").and_then(|v| v.to_str().ok()).unwrap_or_default().to_string();

    let request = ForwardRequest {
        group_id: caller.group_id,
        platform: Platform::Anthropic,
        forced_platform: None,
        session_hash,
        model,
        stream,
        inbound_protocol: InboundProtocol::Anthropic,
        gemini_action: None,
        body,
        user_agent,
        headers: headers.clone(),
    };

    match state.forwarding.forward(request).await {
        Ok(response) => forward_response::render(response),
        Err(err) => error_response::render(InboundProtocol::Anthropic, &err),
    }
}
