//! Admin surface: Error-Passthrough Rule CRUD and the Operational Retry
//! trigger. See SPEC_FULL.md §4.4 "Admin CRUD" and §4.5 "Trigger".
//!
//! Full admin RBAC/user-account management is an external collaborator
//! (out of scope per spec.md §1); these routes only require a valid
//! proxy API key, same as the forwarding routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::model::{ErrorPassthroughRule, RetryMode};
use crate::ops_retry::RetryRequest;

use super::routes::AppState;
use super::auth;

fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    auth::authenticate(&state.config, headers)
        .map(|_| ())
        .map_err(|_| (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid or missing api key" }))).into_response())
}

/// `GET /v1/ops/health` — outbox watermark and lag, a diagnostics-only
/// view onto the Snapshot Cache's own backlog signal.
pub async fn health(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_auth(&state, &headers) {
        return resp;
    }
    let watermark = state.cache.get_watermark().await;
    let max_id = state.outbox.max_id().await;
    Json(json!({
        "outbox_watermark": watermark,
        "outbox_max_id": max_id,
        "outbox_lag": (max_id - watermark).max(0),
    }))
    .into_response()
}

/// `GET /v1/ops/accounts` — per-bucket account counts from the current
/// snapshot cache, for inspecting what the scheduler would actually see.
pub async fn accounts_snapshot(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_auth(&state, &headers) {
        return resp;
    }
    let mut buckets = Vec::new();
    for key in state.cache.known_bucket_keys().await {
        if let Some(entry) = state.cache.get_bucket_snapshot(key).await {
            buckets.push(json!({
                "group_id": key.group_id,
                "platform": key.platform.as_str(),
                "mode": format!("{:?}", key.mode),
                "account_count": entry.accounts.len(),
                "last_built_at": entry.last_built_at,
            }));
        }
    }
    Json(json!({ "buckets": buckets })).into_response()
}

pub async fn list_rules(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_auth(&state, &headers) {
        return resp;
    }
    Json(state.rules.list().await).into_response()
}

pub async fn create_rule(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(rule): Json<ErrorPassthroughRule>) -> Response {
    if let Err(resp) = require_auth(&state, &headers) {
        return resp;
    }
    match state.rules.create(rule).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(message) => (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response(),
    }
}

pub async fn update_rule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(mut rule): Json<ErrorPassthroughRule>,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers) {
        return resp;
    }
    rule.id = id;
    match state.rules.update(rule).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(message) => (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response(),
    }
}

pub async fn delete_rule(State(state): State<Arc<AppState>>, headers: HeaderMap, Path(id): Path<i64>) -> Response {
    if let Err(resp) = require_auth(&state, &headers) {
        return resp;
    }
    match state.rules.delete(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(message) => (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct RetryTriggerRequest {
    pub error_id: Uuid,
    pub mode: RetryMode,
    pub pinned_account_id: Option<Uuid>,
    pub event_idx: Option<usize>,
}

pub async fn trigger_retry(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(payload): Json<RetryTriggerRequest>) -> Response {
    if let Err(resp) = require_auth(&state, &headers) {
        return resp;
    }
    let request = RetryRequest {
        requested_by_user_id: 0,
        error_id: payload.error_id,
        mode: payload.mode,
        pinned_account_id: payload.pinned_account_id,
        event_idx: payload.event_idx,
    };
    match state.ops_retry.retry(request).await {
        Ok(attempt) => Json(attempt).into_response(),
        Err(err) => (StatusCode::CONFLICT, Json(json!({ "error": err.message }))).into_response(),
    }
}
