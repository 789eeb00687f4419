//! Forwarding Engine orchestration loop. See SPEC_FULL.md §4.2 "Skeleton
//! per attempt".
//!
//! Ties the pure per-protocol conversion modules (`anthropic`, `openai`,
//! `gemini`, `signature_recovery`) and the retry/failover classification
//! in `super` together with a real `reqwest::Client`, driving: build
//! request → send → classify response → retry / failover / fatal. This
//! is new code — the teacher's closest analog is `api::proxy`'s
//! chain-walking forward loop, generalized here from "one OpenAI-shaped
//! upstream" to the full inbound/upstream protocol matrix.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use uuid::Uuid;

use crate::config::UrlAllowlistConfig;
use crate::error::{ErrorKind, GatewayError};
use crate::health::{HealthStateMachine, UpstreamResponseMeta};
use crate::model::{AccountProjection, AccountType, Platform};
use crate::rules::RuleEngine;
use crate::scheduler::{Scheduler, SelectionOutcome, SelectionRequest};
use crate::usage::NormalizedUsage;

use super::{
    anthropic, backoff_for_attempt, classify_attempt, gemini, openai, signature_recovery, stream_relay,
    AttemptContext, AttemptDecision, ForwardResult, StreamWatchdogConfig, MAX_RETRY_ATTEMPTS,
};

/// Which inbound shape the caller spoke, independent of which upstream
/// the account actually sends to (that's decided per-attempt from the
/// selected account's platform).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundProtocol {
    Anthropic,
    OpenaiResponses,
    GeminiNative,
}

#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub group_id: i64,
    pub platform: Platform,
    pub forced_platform: Option<Platform>,
    pub session_hash: Option<String>,
    pub model: String,
    pub stream: bool,
    pub inbound_protocol: InboundProtocol,
    pub gemini_action: Option<gemini::GeminiAction>,
    pub body: Value,
    pub user_agent: String,
    pub headers: HeaderMap,
}

pub enum ForwardBody {
    Json(Value),
    Raw { bytes: Bytes, content_type: String },
    Stream { stream: Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>, content_type: String },
}

impl std::fmt::Debug for ForwardBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardBody::Json(value) => f.debug_tuple("Json").field(value).finish(),
            ForwardBody::Raw { content_type, .. } => f.debug_struct("Raw").field("content_type", content_type).finish(),
            ForwardBody::Stream { content_type, .. } => f.debug_struct("Stream").field("content_type", content_type).finish(),
        }
    }
}

#[derive(Debug)]
pub struct ForwardResponse {
    pub status: u16,
    pub body: ForwardBody,
    pub result: ForwardResult,
}

pub struct ForwardingEngine {
    client: reqwest::Client,
    scheduler: Arc<Scheduler>,
    health: Arc<HealthStateMachine>,
    rules: Arc<RuleEngine>,
    watchdog: StreamWatchdogConfig,
    url_allowlist: UrlAllowlistConfig,
}

impl ForwardingEngine {
    pub fn new(
        client: reqwest::Client,
        scheduler: Arc<Scheduler>,
        health: Arc<HealthStateMachine>,
        rules: Arc<RuleEngine>,
        watchdog: StreamWatchdogConfig,
        url_allowlist: UrlAllowlistConfig,
    ) -> Arc<Self> {
        Arc::new(Self { client, scheduler, health, rules, watchdog, url_allowlist })
    }

    pub async fn forward(&self, request: ForwardRequest) -> Result<ForwardResponse, GatewayError> {
        let mut exclusions = HashSet::new();
        let mut ctx = AttemptContext::new(request.body.clone());
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();

        loop {
            let selection = self
                .scheduler
                .select_account(SelectionRequest {
                    group_id: Some(request.group_id),
                    platform: request.platform,
                    forced_platform: request.forced_platform,
                    session_hash: request.session_hash.clone(),
                    requested_model: request.model.clone(),
                    exclusions: exclusions.clone(),
                    is_ai_studio_endpoint: false,
                })
                .await?;
            let (account, _slot_guard) = match selection {
                SelectionOutcome::Selected(p, guard) => (p, guard),
                SelectionOutcome::WaitPlan { .. } => return Err(GatewayError::no_available_accounts()),
            };

            let attempt = self.send_one(&request, &account, &ctx, &request_id, started).await;

            match attempt {
                Ok(response) => return Ok(response),
                Err(AttemptOutcome::Retry { recovered_body }) => {
                    if let Some((stage, body)) = recovered_body {
                        ctx.signature_recovery_stage = stage;
                        ctx.rewritten_body = body;
                    }
                    ctx.attempts_used += 1;
                    if ctx.attempts_used >= MAX_RETRY_ATTEMPTS {
                        return Err(GatewayError::no_available_accounts());
                    }
                    tokio::time::sleep(backoff_for_attempt(ctx.attempts_used)).await;
                    continue;
                }
                Err(AttemptOutcome::Failover) => {
                    exclusions.insert(account.id);
                    ctx.attempts_used += 1;
                    if ctx.attempts_used >= MAX_RETRY_ATTEMPTS {
                        return Err(GatewayError::no_available_accounts());
                    }
                    continue;
                }
                Err(AttemptOutcome::Fatal(err)) => return Err(err),
            }
        }
    }

    /// Single-attempt send against an already-selected account, bypassing
    /// the scheduler. Used by the operational retry replayer (SPEC_FULL.md
    /// §4.5), which pins its own account rather than letting this engine
    /// select one.
    pub async fn forward_once(&self, request: &ForwardRequest, account: &AccountProjection) -> Result<ForwardResponse, GatewayError> {
        let ctx = AttemptContext::new(request.body.clone());
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        self.send_one(request, account, &ctx, &request_id, started).await.map_err(|outcome| match outcome {
            AttemptOutcome::Fatal(err) => err,
            AttemptOutcome::Retry { .. } => GatewayError::new(ErrorKind::UpstreamError, "upstream requested retry during replay"),
            AttemptOutcome::Failover => GatewayError::upstream_failover(),
        })
    }

    async fn send_one(
        &self,
        request: &ForwardRequest,
        account: &AccountProjection,
        ctx: &AttemptContext,
        request_id: &str,
        started: Instant,
    ) -> Result<ForwardResponse, AttemptOutcome> {
        let is_code_assist_oauth = account.platform == Platform::Gemini
            && account.account_type == AccountType::Oauth
            && account.credentials.project_id.is_some();

        let (gemini_action, needs_gemini_aggregation) = self.effective_gemini_request(request, account);

        let (url, upstream_body, headers) = self
            .build_upstream(request, account, &ctx.rewritten_body, gemini_action)
            .map_err(AttemptOutcome::Fatal)?;
        self.url_allowlist.check(&url).map_err(AttemptOutcome::Fatal)?;

        let mut builder = self.client.post(&url).json(&upstream_body);
        for (k, v) in &headers {
            builder = builder.header(k.as_str(), v.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            AttemptOutcome::Failover.with_network_error(&e)
        })?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            if request.stream {
                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("text/event-stream")
                    .to_string();
                let mut upstream_stream = Box::pin(response.bytes_stream());
                let first = tokio::time::timeout(self.watchdog.data_interval_timeout, upstream_stream.next()).await;
                let head = match first {
                    Ok(Some(Ok(bytes))) => bytes,
                    Ok(Some(Err(e))) => return Err(AttemptOutcome::Failover.with_network_error(&e)),
                    Ok(None) => Bytes::new(),
                    Err(_elapsed) => {
                        self.health.record_stream_stall(account.id).await;
                        return Err(AttemptOutcome::Failover);
                    }
                };
                let first_token_ms = Some(started.elapsed().as_millis() as u64);
                let relayed = stream_relay::relay(head, upstream_stream, self.watchdog, self.health.clone(), account.id, account.platform);
                let result = ForwardResult {
                    request_id: request_id.to_string(),
                    usage: NormalizedUsage::default(),
                    model: request.model.clone(),
                    stream: true,
                    duration: started.elapsed(),
                    first_token_ms,
                    image_count: 0,
                    image_size_bytes: 0,
                };
                return Ok(ForwardResponse { status, body: ForwardBody::Stream { stream: relayed, content_type }, result });
            }

            if needs_gemini_aggregation {
                let chunks = collect_gemini_stream_chunks(response).await.map_err(|e| AttemptOutcome::Failover.with_network_error(&e))?;
                let aggregated = gemini::aggregate_stream_chunks(&chunks);
                let synthetic = serde_json::json!({
                    "candidates": [{
                        "content": { "role": "model", "parts": aggregated.parts },
                        "finishReason": aggregated.finish_reason,
                    }],
                });
                let (translated, _) = self.translate_response(request, account.platform, &synthetic);
                let result = ForwardResult {
                    request_id: request_id.to_string(),
                    usage: aggregated.usage.unwrap_or_default(),
                    model: request.model.clone(),
                    stream: false,
                    duration: started.elapsed(),
                    first_token_ms: None,
                    image_count: 0,
                    image_size_bytes: 0,
                };
                return Ok(ForwardResponse { status, body: ForwardBody::Json(translated), result });
            }

            let body: Value = response.json().await.unwrap_or(Value::Null);
            let (translated, usage) = self.translate_response(request, account.platform, &body);
            let result = ForwardResult {
                request_id: request_id.to_string(),
                usage,
                model: request.model.clone(),
                stream: false,
                duration: started.elapsed(),
                first_token_ms: None,
                image_count: 0,
                image_size_bytes: 0,
            };
            return Ok(ForwardResponse { status, body: ForwardBody::Json(translated), result });
        }

        let response_headers: std::collections::HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_lowercase(), v.to_string())))
            .collect();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let body_text_lowercase = body.to_string().to_lowercase();

        self.health
            .record_response(UpstreamResponseMeta {
                account_id: account.id,
                platform: account.platform,
                status_code: status,
                headers: response_headers,
                body: body.clone(),
                body_text_lowercase: body_text_lowercase.clone(),
            })
            .await;

        if account.platform == Platform::Gemini && status == 400 && signature_recovery::is_signature_error(&body) {
            if let Some((stage, recovered)) = signature_recovery::next_stage_body(&ctx.rewritten_body, ctx.signature_recovery_stage) {
                return Err(AttemptOutcome::Retry { recovered_body: Some((stage, recovered)) });
            }
        }

        if let Some(rule) = self.rules.match_rule(account.platform.as_str(), status, &body_text_lowercase).await {
            let applied = crate::rules::RuleEngine::apply(&rule, status);
            let passthrough_body = if applied.passthrough_body {
                body.clone()
            } else {
                serde_json::json!({ "type": "error", "error": { "message": applied.custom_message.unwrap_or_default() } })
            };
            return Err(AttemptOutcome::Fatal(GatewayError::new(
                ErrorKind::UpstreamError,
                crate::error::scrub_sensitive(&passthrough_body.to_string()),
            )));
        }

        let decision = classify_attempt(status, ctx.attempts_used, is_code_assist_oauth, false);
        match decision {
            AttemptDecision::Retry => Err(AttemptOutcome::Retry { recovered_body: None }),
            AttemptDecision::Failover => Err(AttemptOutcome::Failover),
            AttemptDecision::Fatal => {
                let message = crate::error::scrub_sensitive(&body.to_string());
                if matches!(account.platform, Platform::Gemini | Platform::Antigravity) {
                    if let Some(google_status) = body.get("error").and_then(|e| e.get("status")).and_then(|v| v.as_str()) {
                        return Err(AttemptOutcome::Fatal(GatewayError::new(gemini::status_to_error_kind(google_status), message)));
                    }
                }
                Err(AttemptOutcome::Fatal(crate::error::classify_http_status(status, message)))
            }
        }
    }

    /// Resolves which Gemini action is actually sent upstream, and whether
    /// the result needs aggregating back into a non-streaming response.
    /// OAuth `generateContent` is unreliable non-streaming (SPEC_FULL.md §6),
    /// so it's always sent as `streamGenerateContent` and aggregated when
    /// the caller didn't ask for a stream themselves.
    fn effective_gemini_request(&self, request: &ForwardRequest, account: &AccountProjection) -> (gemini::GeminiAction, bool) {
        if !matches!(account.platform, Platform::Gemini | Platform::Antigravity) {
            return (gemini::GeminiAction::GenerateContent, false);
        }
        let requested = request.gemini_action.unwrap_or(match request.inbound_protocol {
            InboundProtocol::GeminiNative => gemini::GeminiAction::StreamGenerateContent,
            _ => gemini::GeminiAction::GenerateContent,
        });
        let is_oauth = account.account_type == AccountType::Oauth;
        if is_oauth && requested == gemini::GeminiAction::GenerateContent && !request.stream {
            (gemini::GeminiAction::StreamGenerateContent, true)
        } else {
            (requested, false)
        }
    }

    fn build_upstream(
        &self,
        request: &ForwardRequest,
        account: &AccountProjection,
        body: &Value,
        gemini_action: gemini::GeminiAction,
    ) -> Result<(String, Value, Vec<(String, String)>), GatewayError> {
        let mut headers: Vec<(String, String)> = Vec::new();
        match (request.inbound_protocol, account.platform) {
            (InboundProtocol::Anthropic, Platform::Anthropic) => {
                let url = "https://api.anthropic.com/v1/messages".to_string();
                if let Some(key) = &account.credentials.api_key {
                    headers.push(("x-api-key".to_string(), key.clone()));
                } else if let Some(token) = &account.credentials.access_token {
                    headers.push(("authorization".to_string(), format!("Bearer {token}")));
                }
                Ok((url, body.clone(), headers))
            }
            (InboundProtocol::Anthropic, Platform::Gemini | Platform::Antigravity) => {
                let gemini_body = anthropic::anthropic_to_gemini_request(body);
                let route = gemini::route_request(&account.credentials, &request.model, gemini_action, &gemini_body);
                match route {
                    gemini::GeminiRoute::CodeAssist { url, wrapped_body } => {
                        if let Some(token) = &account.credentials.access_token {
                            headers.push(("authorization".to_string(), format!("Bearer {token}")));
                        }
                        Ok((url, wrapped_body, headers))
                    }
                    gemini::GeminiRoute::AiStudio { url } => {
                        if let Some(key) = &account.credentials.api_key {
                            headers.push(("x-goog-api-key".to_string(), key.clone()));
                        } else if let Some(token) = &account.credentials.access_token {
                            headers.push(("authorization".to_string(), format!("Bearer {token}")));
                        }
                        Ok((url, gemini_body, headers))
                    }
                }
            }
            (InboundProtocol::OpenaiResponses, Platform::Openai) => {
                let passthrough = account.credentials.oauth_type.as_deref() == Some("chatgpt_passthrough");
                let url = if passthrough {
                    "https://chatgpt.com/backend-api/codex/responses".to_string()
                } else {
                    "https://api.openai.com/v1/responses".to_string()
                };
                let transformed = if passthrough {
                    body.clone()
                } else {
                    openai::apply_legacy_transform(body, &request.user_agent, None)
                };
                if passthrough {
                    // Per SPEC_FULL.md §6: only the inbound headers not in
                    // `PASSTHROUGH_STRIPPED_HEADERS` (and not Host/Content-Length,
                    // which reqwest sets from the URL/body) ride along; Host is
                    // pinned to chatgpt.com regardless of what the caller sent.
                    for (name, value) in request.headers.iter() {
                        let lower = name.as_str().to_lowercase();
                        if openai::PASSTHROUGH_STRIPPED_HEADERS.contains(&lower.as_str()) || lower == "host" || lower == "content-length" {
                            continue;
                        }
                        if let Ok(v) = value.to_str() {
                            headers.push((lower, v.to_string()));
                        }
                    }
                    headers.push(("host".to_string(), "chatgpt.com".to_string()));
                    if let Some(chatgpt_id) = &account.credentials.chatgpt_account_id {
                        headers.push(("chatgpt-account-id".to_string(), chatgpt_id.clone()));
                    }
                }
                if let Some(token) = &account.credentials.access_token {
                    headers.push(("authorization".to_string(), format!("Bearer {token}")));
                } else if let Some(key) = &account.credentials.api_key {
                    headers.push(("authorization".to_string(), format!("Bearer {key}")));
                }
                Ok((url, transformed, headers))
            }
            (InboundProtocol::GeminiNative, Platform::Gemini | Platform::Antigravity) => {
                let route = gemini::route_request(&account.credentials, &request.model, gemini_action, body);
                match route {
                    gemini::GeminiRoute::CodeAssist { url, wrapped_body } => {
                        if let Some(token) = &account.credentials.access_token {
                            headers.push(("authorization".to_string(), format!("Bearer {token}")));
                        }
                        Ok((url, wrapped_body, headers))
                    }
                    gemini::GeminiRoute::AiStudio { url } => {
                        if let Some(key) = &account.credentials.api_key {
                            headers.push(("x-goog-api-key".to_string(), key.clone()));
                        } else if let Some(token) = &account.credentials.access_token {
                            headers.push(("authorization".to_string(), format!("Bearer {token}")));
                        }
                        Ok((url, body.clone(), headers))
                    }
                }
            }
            _ => Err(GatewayError::new(ErrorKind::UnsupportedAccountType, "no forwarding path for this inbound/upstream pairing")),
        }
    }

    /// Converts one upstream-shaped response body back into the shape the
    /// caller's inbound protocol expects, and extracts its usage in the
    /// same pass. `upstream_platform` is the selected account's platform,
    /// independent of `request.inbound_protocol`.
    fn translate_response(&self, request: &ForwardRequest, upstream_platform: Platform, body: &Value) -> (Value, NormalizedUsage) {
        match upstream_platform {
            Platform::Gemini | Platform::Antigravity if body.get("candidates").is_some() => {
                let parts = body
                    .get("candidates")
                    .and_then(|c| c.as_array())
                    .and_then(|c| c.first())
                    .and_then(|c| c.get("content"))
                    .and_then(|c| c.get("parts"))
                    .and_then(|p| p.as_array())
                    .cloned()
                    .unwrap_or_default();
                let usage = body
                    .get("usageMetadata")
                    .map(|meta| {
                        NormalizedUsage::from_gemini(
                            meta.get("promptTokenCount").and_then(|v| v.as_u64()).unwrap_or(0),
                            meta.get("candidatesTokenCount").and_then(|v| v.as_u64()).unwrap_or(0),
                            meta.get("cachedContentTokenCount").and_then(|v| v.as_u64()).unwrap_or(0),
                        )
                    })
                    .unwrap_or_default();
                let translated = match request.inbound_protocol {
                    InboundProtocol::Anthropic => serde_json::json!({
                        "type": "message",
                        "role": "assistant",
                        "content": anthropic::gemini_parts_to_anthropic_content(&parts),
                    }),
                    _ => body.clone(),
                };
                (translated, usage)
            }
            Platform::Openai => {
                let mut translated = body.clone();
                if request.inbound_protocol == InboundProtocol::OpenaiResponses {
                    openai::rewrite_model_field(&mut translated, &request.model);
                }
                let usage = translated
                    .get("usage")
                    .map(|u| {
                        NormalizedUsage::from_openai(
                            u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                            u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                            u.get("input_tokens_details").and_then(|d| d.get("cached_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
                        )
                    })
                    .unwrap_or_default();
                (translated, usage)
            }
            Platform::Anthropic => {
                let usage = body
                    .get("usage")
                    .map(|u| {
                        NormalizedUsage::from_anthropic(
                            u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                            u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                            u.get("cache_read_input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                            u.get("cache_creation_input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                        )
                    })
                    .unwrap_or_default();
                (body.clone(), usage)
            }
            _ => (body.clone(), NormalizedUsage::default()),
        }
    }
}

/// Drains an upstream `streamGenerateContent` response into its raw
/// `data: {...}` JSON chunks without relaying anything to the caller —
/// used only when a non-streaming Gemini OAuth call was forced to stream
/// upstream and needs aggregating back (SPEC_FULL.md §6).
async fn collect_gemini_stream_chunks(response: reqwest::Response) -> Result<Vec<Value>, reqwest::Error> {
    let mut stream = Box::pin(response.bytes_stream());
    let mut buf: Vec<u8> = Vec::new();
    let mut chunks = Vec::new();
    while let Some(item) = stream.next().await {
        buf.extend_from_slice(&item?);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let Ok(text) = std::str::from_utf8(&line) else { continue };
            let Some(json_str) = text.trim_end().strip_prefix("data: ") else { continue };
            let trimmed = json_str.trim();
            if trimmed.is_empty() || trimmed == "[DONE]" {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                chunks.push(value);
            }
        }
    }
    Ok(chunks)
}

enum AttemptOutcome {
    Retry { recovered_body: Option<(u8, Value)> },
    Failover,
    Fatal(GatewayError),
}

impl AttemptOutcome {
    fn with_network_error(self, err: &reqwest::Error) -> Self {
        tracing::warn!(error = %err, "upstream request failed at the transport layer");
        self
    }
}

/// Total wall-clock budget for a per-request streaming watchdog; exposed
/// so callers can size their SSE relay loop's `tokio::time::timeout`.
pub fn data_interval_timeout(config: &StreamWatchdogConfig) -> Duration {
    config.data_interval_timeout
}
