//! Operational Retry engine. See SPEC_FULL.md §4.5.
//!
//! Reconstructs a recorded failed request and replays it against either
//! the same pinned account or a freshly scheduled one. New code (the
//! teacher has no direct analog) built in the idiom of `scheduler::Scheduler`
//! and `rules::RuleEngine`: trait-injected collaborators, `Arc`-shared
//! state, colocated `#[cfg(test)]` coverage.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::model::{RetryAttempt, RetryAttemptStatus, RetryMode, SourceError};
use crate::scheduler::{Scheduler, SelectionOutcome, SelectionRequest};
use crate::store::OpsRepository;

pub const RETRY_THROTTLE: Duration = Duration::from_secs(10);
pub const RETRY_OVERALL_TIMEOUT: Duration = Duration::from_secs(60);
pub const RESPONSE_CAPTURE_LIMIT: usize = 64 * 1024;
pub const RESPONSE_PREVIEW_LIMIT: usize = 8 * 1024;
const MAX_CLIENT_SWITCHES: u32 = 3;

/// Outcome of replaying the request once against a chosen account.
#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub http_status: u16,
    pub upstream_request_id: Option<String>,
    pub response_body: Vec<u8>,
    pub succeeded: bool,
    pub error_message: Option<String>,
}

/// Injected collaborator that actually sends the reconstructed request to
/// one account's upstream. Production wiring backs this with the
/// Forwarding Engine; tests supply a canned outcome.
#[async_trait]
pub trait RequestReplayer: Send + Sync {
    async fn replay(&self, source: &SourceError, account_id: Uuid, body: &serde_json::Value) -> ReplayOutcome;
}

pub struct OpsRetryEngine {
    ops: Arc<dyn OpsRepository>,
    scheduler: Arc<Scheduler>,
    replayer: Arc<dyn RequestReplayer>,
}

#[derive(Debug, Clone)]
pub struct RetryRequest {
    pub requested_by_user_id: i64,
    pub error_id: Uuid,
    pub mode: RetryMode,
    pub pinned_account_id: Option<Uuid>,
    pub event_idx: Option<usize>,
}

impl OpsRetryEngine {
    pub fn new(ops: Arc<dyn OpsRepository>, scheduler: Arc<Scheduler>, replayer: Arc<dyn RequestReplayer>) -> Arc<Self> {
        Arc::new(Self { ops, scheduler, replayer })
    }

    pub async fn retry(&self, request: RetryRequest) -> Result<RetryAttempt, GatewayError> {
        let Some(source) = self.ops.get_source_error(request.error_id).await else {
            return Err(GatewayError::new(crate::error::ErrorKind::NotFound, "source error not found"));
        };

        if self.ops.has_running_attempt(request.error_id).await {
            return Err(GatewayError::ops_retry_in_progress());
        }
        if let Some(last_started) = self.ops.last_attempt_started_at(request.error_id).await {
            if Utc::now().signed_duration_since(last_started) < chrono::Duration::from_std(RETRY_THROTTLE).unwrap() {
                return Err(GatewayError::ops_retry_too_frequent());
            }
        }

        let attempt_id = Uuid::new_v4();
        let mut attempt = RetryAttempt {
            id: attempt_id,
            source_error_id: request.error_id,
            mode: request.mode,
            pinned_account_id: request.pinned_account_id,
            status: RetryAttemptStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            http_status: None,
            upstream_request_id: None,
            used_account_id: None,
            response_preview: None,
            response_truncated: false,
            error_message: None,
        };
        self.ops.insert_retry_attempt(attempt.clone()).await;

        let result = tokio::time::timeout(RETRY_OVERALL_TIMEOUT, self.run(&source, &request)).await;

        match result {
            Ok(Ok(outcome)) => {
                attempt.status = if outcome.succeeded { RetryAttemptStatus::Succeeded } else { RetryAttemptStatus::Failed };
                attempt.http_status = Some(outcome.http_status);
                attempt.upstream_request_id = outcome.upstream_request_id;
                attempt.error_message = outcome.error_message;
                let (preview, truncated) = capture_preview(&outcome.response_body);
                attempt.response_preview = Some(preview);
                attempt.response_truncated = truncated;
                if outcome.succeeded {
                    self.ops.mark_resolved(request.error_id).await;
                }
            }
            Ok(Err(err)) => {
                attempt.status = RetryAttemptStatus::Failed;
                attempt.error_message = Some(err.message.clone());
            }
            Err(_) => {
                attempt.status = RetryAttemptStatus::Failed;
                attempt.error_message = Some("retry attempt exceeded overall timeout".to_string());
            }
        }
        attempt.finished_at = Some(Utc::now());
        self.ops.update_retry_attempt(attempt.clone()).await;
        Ok(attempt)
    }

    async fn run(&self, source: &SourceError, request: &RetryRequest) -> Result<ReplayOutcome, GatewayError> {
        match request.mode {
            RetryMode::Upstream => {
                let account_id = request.pinned_account_id.unwrap_or(source.original_account_id);
                self.replay_pinned(source, account_id).await
            }
            RetryMode::UpstreamEvent => {
                let idx = request.event_idx.ok_or_else(|| {
                    GatewayError::new(crate::error::ErrorKind::OpsRetryPinnedAccountRequired, "event_idx is required for upstream_event mode")
                })?;
                let entry = source.upstream_errors.get(idx).ok_or_else(|| {
                    GatewayError::new(crate::error::ErrorKind::InvalidRequest, "event_idx out of range")
                })?;
                let outcome = self.replayer.replay(source, entry.account_id, &entry.upstream_request_body).await;
                Ok(outcome)
            }
            RetryMode::Client => self.replay_via_scheduler(source).await,
        }
    }

    async fn replay_pinned(&self, source: &SourceError, account_id: Uuid) -> Result<ReplayOutcome, GatewayError> {
        // Caller-side policy: the pinned account must be currently
        // schedulable and belong to the same group as the original
        // request. The scheduler's snapshot is consulted via a
        // single-account selection with an explicit forced platform and
        // no exclusions, which fails if the account isn't eligible.
        let selection = self
            .scheduler
            .select_account(SelectionRequest {
                group_id: Some(source.group_id),
                platform: source.platform,
                forced_platform: Some(source.platform),
                session_hash: None,
                requested_model: source.model.clone(),
                exclusions: HashSet::new(),
                is_ai_studio_endpoint: false,
            })
            .await?;
        let (selected_id, _slot_guard) = match selection {
            SelectionOutcome::Selected(p, guard) if p.id == account_id => (p.id, guard),
            _ => {
                return Err(GatewayError::new(
                    crate::error::ErrorKind::OpsRetryPinnedAccountRequired,
                    "pinned account is not currently schedulable in the original group",
                ))
            }
        };
        Ok(self.replayer.replay(source, selected_id, &source.body).await)
    }

    async fn replay_via_scheduler(&self, source: &SourceError) -> Result<ReplayOutcome, GatewayError> {
        let mut exclusions = HashSet::new();
        let mut switches = 0;
        loop {
            let selection = self
                .scheduler
                .select_account(SelectionRequest {
                    group_id: Some(source.group_id),
                    platform: source.platform,
                    forced_platform: None,
                    session_hash: None,
                    requested_model: source.model.clone(),
                    exclusions: exclusions.clone(),
                    is_ai_studio_endpoint: false,
                })
                .await?;
            let (account, _slot_guard) = match selection {
                SelectionOutcome::Selected(p, guard) => (p, guard),
                SelectionOutcome::WaitPlan { .. } => return Err(GatewayError::no_available_accounts()),
            };
            let outcome = self.replayer.replay(source, account.id, &source.body).await;
            if outcome.succeeded || !is_failover_status(outcome.http_status) {
                return Ok(outcome);
            }
            exclusions.insert(account.id);
            switches += 1;
            if switches >= MAX_CLIENT_SWITCHES {
                return Ok(outcome);
            }
        }
    }
}

fn is_failover_status(status: u16) -> bool {
    matches!(status, 401 | 403 | 429 | 529) || status >= 500
}

fn capture_preview(body: &[u8]) -> (String, bool) {
    let captured = if body.len() > RESPONSE_CAPTURE_LIMIT { &body[..RESPONSE_CAPTURE_LIMIT] } else { body };
    let truncated = body.len() > RESPONSE_CAPTURE_LIMIT;
    let preview_bytes = if captured.len() > RESPONSE_PREVIEW_LIMIT { &captured[..RESPONSE_PREVIEW_LIMIT] } else { captured };
    (String::from_utf8_lossy(preview_bytes).into_owned(), truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Platform;
    use crate::store::{InProcessDistributedCache, JsonAccountStore, JsonOpsStore};
    use std::collections::HashMap;

    struct AlwaysSucceeds;

    #[async_trait]
    impl RequestReplayer for AlwaysSucceeds {
        async fn replay(&self, _source: &SourceError, _account_id: Uuid, _body: &serde_json::Value) -> ReplayOutcome {
            ReplayOutcome {
                http_status: 200,
                upstream_request_id: Some("req-1".to_string()),
                response_body: b"{\"ok\":true}".to_vec(),
                succeeded: true,
                error_message: None,
            }
        }
    }

    fn sample_source(group_id: i64, account_id: Uuid) -> SourceError {
        SourceError {
            id: Uuid::new_v4(),
            group_id,
            platform: Platform::Anthropic,
            model: "claude-3".to_string(),
            path: "/v1/messages".to_string(),
            upstream_method: "POST".to_string(),
            headers: HashMap::new(),
            body: serde_json::json!({ "model": "claude-3" }),
            original_account_id: account_id,
            upstream_errors: Vec::new(),
            resolved: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn second_retry_within_ten_seconds_is_throttled() {
        let temp = tempfile::tempdir().unwrap();
        let ops = Arc::new(JsonOpsStore::new(temp.path().join("ops.json")).await);
        let accounts = Arc::new(JsonAccountStore::new(temp.path().join("accounts.json")).await);
        let cache = InProcessDistributedCache::new();
        let scheduler = Arc::new(Scheduler::new(accounts, cache, crate::scheduler::SchedulerConfig::default()));
        let engine = OpsRetryEngine::new(ops.clone(), scheduler, Arc::new(AlwaysSucceeds));

        let account_id = Uuid::new_v4();
        let source = sample_source(1, account_id);
        let error_id = source.id;
        ops.record_source_error(source).await;

        let first = engine
            .retry(RetryRequest { requested_by_user_id: 1, error_id, mode: RetryMode::UpstreamEvent, pinned_account_id: None, event_idx: Some(0) })
            .await;
        // No upstream_errors recorded, so event_idx 0 is out of range and
        // the attempt fails fast without ever running the replayer — but
        // it still records an attempt and a started_at timestamp, which is
        // what the throttle keys off.
        assert!(first.is_ok());

        let second = engine
            .retry(RetryRequest { requested_by_user_id: 1, error_id, mode: RetryMode::UpstreamEvent, pinned_account_id: None, event_idx: Some(0) })
            .await;
        assert!(matches!(second, Err(ref e) if e.kind == crate::error::ErrorKind::OpsRetryTooFrequent));
    }

    #[test]
    fn preview_capture_truncates_and_reports_flag() {
        let body = vec![b'a'; RESPONSE_CAPTURE_LIMIT + 10];
        let (preview, truncated) = capture_preview(&body);
        assert!(truncated);
        assert!(preview.len() <= RESPONSE_PREVIEW_LIMIT);
    }

    #[test]
    fn small_body_is_not_truncated() {
        let (preview, truncated) = capture_preview(b"hello");
        assert!(!truncated);
        assert_eq!(preview, "hello");
    }
}
