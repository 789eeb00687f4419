//! Router wiring and process entry point. See SPEC_FULL.md §1 "AMBIENT
//! STACK — runtime shape".
//!
//! Builds the JSON-file-backed repositories from `Config::data_dir`,
//! wires the five core subsystems together, spawns their background
//! workers (outbox poller, full-rebuild ticker, last-used flusher, rule
//! subscriber), and serves the HTTP surface with axum — the same
//! construct-collaborators-then-`axum::serve` shape as the original
//! `api::router::build_router` / `main`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::{delete, get, post, put};
use axum::Router;
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::forwarding::engine::{ForwardBody, ForwardRequest, ForwardingEngine, InboundProtocol};
use crate::forwarding::{gemini, StreamWatchdogConfig};
use crate::health::{HealthConfig, HealthStateMachine};
use crate::model::{Platform, SourceError};
use crate::ops_retry::{OpsRetryEngine, ReplayOutcome, RequestReplayer};
use crate::rules::RuleEngine;
use crate::scheduler::{Scheduler, SchedulerConfig, SnapshotConfig, SnapshotService};
use crate::store::{
    DistributedCache, InProcessDistributedCache, JsonAccountStore, JsonOpsStore, JsonOutboxStore, SchedulerOutboxRepository,
};

use super::{anthropic, gemini as gemini_api, openai, ops};

pub struct AppState {
    pub config: Config,
    pub scheduler: Arc<Scheduler>,
    pub health: Arc<HealthStateMachine>,
    pub rules: Arc<RuleEngine>,
    pub forwarding: Arc<ForwardingEngine>,
    pub ops_retry: Arc<OpsRetryEngine>,
    pub http_client: reqwest::Client,
    /// Only read from the diagnostics routes (`GET /v1/ops/*`); every
    /// mutation goes through `scheduler`/`health`/`rules`.
    pub cache: Arc<dyn DistributedCache>,
    pub outbox: Arc<dyn SchedulerOutboxRepository>,
}

/// Bridges `OpsRetryEngine`'s account-pinned replay contract onto the
/// Forwarding Engine's single-attempt send path.
struct ForwardingReplayer {
    forwarding: Arc<ForwardingEngine>,
    cache: Arc<dyn DistributedCache>,
}

#[async_trait]
impl RequestReplayer for ForwardingReplayer {
    async fn replay(&self, source: &SourceError, account_id: Uuid, body: &Value) -> ReplayOutcome {
        let Some(account) = self.cache.get_account_projection(account_id).await else {
            return ReplayOutcome {
                http_status: 0,
                upstream_request_id: None,
                response_body: Vec::new(),
                succeeded: false,
                error_message: Some("pinned account projection not found in cache".to_string()),
            };
        };

        let inbound_protocol = match source.platform {
            Platform::Anthropic => InboundProtocol::Anthropic,
            Platform::Openai => InboundProtocol::OpenaiResponses,
            Platform::Gemini | Platform::Antigravity => InboundProtocol::GeminiNative,
        };
        let request = ForwardRequest {
            group_id: source.group_id,
            platform: source.platform,
            forced_platform: Some(source.platform),
            session_hash: None,
            model: source.model.clone(),
            stream: false,
            inbound_protocol,
            gemini_action: matches!(inbound_protocol, InboundProtocol::GeminiNative).then_some(gemini::GeminiAction::GenerateContent),
            body: body.clone(),
            user_agent: String::new(),
            headers: axum::http::HeaderMap::new(),
        };

        match self.forwarding.forward_once(&request, &account).await {
            Ok(response) => {
                let response_body = match &response.body {
                    ForwardBody::Json(value) => value.to_string().into_bytes(),
                    ForwardBody::Raw { bytes, .. } => bytes.to_vec(),
                };
                let succeeded = (200..300).contains(&response.status);
                ReplayOutcome {
                    http_status: response.status,
                    upstream_request_id: Some(response.result.request_id.clone()),
                    response_body,
                    succeeded,
                    error_message: None,
                }
            }
            Err(err) => ReplayOutcome {
                http_status: 0,
                upstream_request_id: None,
                response_body: Vec::new(),
                succeeded: false,
                error_message: Some(err.message),
            },
        }
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(anthropic::messages))
        .route("/v1/responses", post(openai::responses))
        .route("/v1beta/models", get(gemini_api::list_models))
        .route("/v1beta/models/:model_action", post(gemini_api::generate))
        .route("/v1/ops/health", get(ops::health))
        .route("/v1/ops/accounts", get(ops::accounts_snapshot))
        .route("/v1/ops/rules", get(ops::list_rules).post(ops::create_rule))
        .route("/v1/ops/rules/:id", put(ops::update_rule).delete(ops::delete_rule))
        .route("/v1/ops/retry", post(ops::trigger_retry))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Construct every collaborator from `config`, spawn the background
/// workers, and serve the HTTP surface until the process is killed.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let data_dir = config.data_dir.clone();
    tokio::fs::create_dir_all(&data_dir).await?;

    let account_store = Arc::new(JsonAccountStore::new(data_dir.join("accounts.json")).await);
    let outbox_store = Arc::new(JsonOutboxStore::new(data_dir.join("outbox.json")).await);
    let ops_store = Arc::new(JsonOpsStore::new(data_dir.join("ops.json")).await);
    let cache: Arc<dyn DistributedCache> = InProcessDistributedCache::new();

    let scheduler_config = SchedulerConfig {
        db_fallback_enabled: config.scheduling.db_fallback_enabled,
        db_fallback_max_qps: config.scheduling.db_fallback_max_qps,
        db_fallback_timeout: config.scheduling.db_fallback_timeout,
        max_concurrency_switches: 3,
    };
    let scheduler = Arc::new(Scheduler::new(account_store.clone(), cache.clone(), scheduler_config));

    let health = HealthStateMachine::new(
        account_store.clone(),
        outbox_store.clone(),
        HealthConfig { overload_cooldown: config.ratelimit.overload_cooldown, ..HealthConfig::default() },
    );
    health.clone().spawn_last_used_flusher(Duration::from_secs(5)).await;

    let snapshot = SnapshotService::new(
        account_store.clone(),
        outbox_store.clone(),
        cache.clone(),
        SnapshotConfig {
            outbox_poll_interval: config.scheduling.outbox_poll_interval,
            full_rebuild_interval: config.scheduling.full_rebuild_interval,
            lag_warn: config.scheduling.outbox_lag_warn,
            lag_rebuild: config.scheduling.outbox_lag_rebuild,
            lag_rebuild_failures: config.scheduling.outbox_lag_rebuild_failures,
            backlog_rebuild_rows: config.scheduling.outbox_backlog_rebuild_rows as i64,
        },
    );
    snapshot.clone().spawn_outbox_worker();
    snapshot.clone().spawn_full_rebuild_ticker();
    snapshot.full_rebuild().await;

    let rules = RuleEngine::new(data_dir.join("error_passthrough_rules.json")).await;
    rules.spawn_subscriber();

    let http_client = reqwest::Client::builder().build()?;
    let forwarding = ForwardingEngine::new(
        http_client.clone(),
        scheduler.clone(),
        health.clone(),
        rules.clone(),
        StreamWatchdogConfig {
            data_interval_timeout: config.stream.data_interval_timeout,
            keepalive_interval: Some(config.stream.keepalive_interval),
            max_line_size: config.stream.max_line_size,
        },
        config.url_allowlist.clone(),
    );

    let replayer = Arc::new(ForwardingReplayer { forwarding: forwarding.clone(), cache: cache.clone() });
    let ops_retry = OpsRetryEngine::new(ops_store, scheduler.clone(), replayer);

    let state = Arc::new(AppState {
        config: config.clone(),
        scheduler,
        health,
        rules,
        forwarding,
        ops_retry,
        http_client,
        cache,
        outbox: outbox_store,
    });
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!(%addr, "gateway listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
