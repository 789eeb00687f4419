//! Rate-limit & Health State Machine. See SPEC_FULL.md §4.3.
//!
//! Generalizes `provider_health::{AccountHealth, CooldownReason,
//! BackoffConfig}` from a chain-of-fallback circuit breaker into the
//! richer per-platform transition table the spec describes, operating
//! directly on `Account` rows via `AccountRepository` and emitting the
//! outbox events that keep the snapshot cache coherent.

mod headers;

pub use headers::{parse_anthropic_unified_reset, parse_gemini_reset, parse_openai_body_reset, parse_openai_codex_windows};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::model::{AccountStatus, OutboxEvent, OutboxEventType, Platform};
use crate::store::{AccountRepository, SchedulerOutboxRepository};

#[derive(Debug, Clone)]
pub struct UpstreamResponseMeta {
    pub account_id: Uuid,
    pub platform: Platform,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: serde_json::Value,
    pub body_text_lowercase: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Disabled,
    AuthInvalidated,
    RateLimited,
    Overloaded,
    TempUnschedulable,
    LoggedOnly,
    NoOp,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub overload_cooldown: Duration,
    pub stream_timeout_threshold: u32,
    pub stream_timeout_marks_error: bool,
    pub stream_timeout_cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            overload_cooldown: Duration::from_secs(600),
            stream_timeout_threshold: 3,
            stream_timeout_marks_error: false,
            stream_timeout_cooldown: Duration::from_secs(120),
        }
    }
}

pub struct HealthStateMachine {
    accounts: Arc<dyn AccountRepository>,
    outbox: Arc<dyn SchedulerOutboxRepository>,
    config: HealthConfig,
    last_used_batch: Mutex<HashMap<Uuid, i64>>,
    stream_stall_counts: Mutex<HashMap<Uuid, u32>>,
}

impl HealthStateMachine {
    pub fn new(accounts: Arc<dyn AccountRepository>, outbox: Arc<dyn SchedulerOutboxRepository>, config: HealthConfig) -> Arc<Self> {
        Arc::new(Self {
            accounts,
            outbox,
            config,
            last_used_batch: Mutex::new(HashMap::new()),
            stream_stall_counts: Mutex::new(HashMap::new()),
        })
    }

    /// Queue a `last_used` stamp for the next coalesced flush rather than
    /// emitting one outbox event per request.
    pub async fn note_last_used(&self, account_id: Uuid) {
        self.last_used_batch.lock().await.insert(account_id, Utc::now().timestamp());
    }

    pub async fn spawn_last_used_flusher(self: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                self.flush_last_used().await;
            }
        });
    }

    async fn flush_last_used(&self) {
        let batch: HashMap<Uuid, i64> = {
            let mut guard = self.last_used_batch.lock().await;
            std::mem::take(&mut *guard)
        };
        if batch.is_empty() {
            return;
        }
        let stamps: HashMap<Uuid, DateTime<Utc>> = batch
            .iter()
            .filter_map(|(id, secs)| DateTime::from_timestamp(*secs, 0).map(|t| (*id, t)))
            .collect();
        self.accounts.set_last_used_bulk(&stamps).await;

        let payload = serde_json::json!({ "last_used": batch });
        self.emit(OutboxEventType::AccountLastUsed, None, None, payload).await;
    }

    /// Apply the transition table of SPEC_FULL.md §4.3 for one upstream
    /// response and persist the resulting account state.
    pub async fn record_response(&self, meta: UpstreamResponseMeta) -> Transition {
        let Some(mut account) = self.accounts.get(meta.account_id).await else {
            return Transition::NoOp;
        };

        let now = Utc::now();

        // Per-account custom error codes (api-key accounts only): a code
        // outside the list is entirely ignored (no retry, no mark); a code
        // inside the list always forces `status=error`, bypassing the
        // per-status transition table below.
        if account.account_type == crate::model::AccountType::ApiKey {
            if let Some(codes) = &account.custom_error_codes {
                if !codes.is_empty() {
                    if !codes.contains(&meta.status_code) {
                        return Transition::NoOp;
                    }
                    account.status = AccountStatus::Error;
                    account.schedulable = false;
                    account.updated_at = now;
                    let group_ids: Vec<i64> = account.group_ids.iter().copied().collect();
                    self.accounts.upsert(account).await;
                    self.emit(
                        OutboxEventType::AccountChanged,
                        Some(meta.account_id),
                        None,
                        serde_json::json!({ "group_ids": group_ids }),
                    )
                    .await;
                    return Transition::Disabled;
                }
            }
        }

        let transition = if meta.status_code == 400 && meta.body_text_lowercase.contains("organization has been disabled") {
            account.status = AccountStatus::Error;
            account.schedulable = false;
            Transition::Disabled
        } else if meta.status_code == 401 {
            if account.account_type == crate::model::AccountType::Oauth {
                account.credentials.access_token = None;
            }
            account.status = AccountStatus::Error;
            account.schedulable = false;
            Transition::AuthInvalidated
        } else if matches!(meta.status_code, 402 | 403) {
            account.status = AccountStatus::Error;
            account.schedulable = false;
            Transition::Disabled
        } else if meta.status_code == 429 {
            let reset = match meta.platform {
                Platform::Anthropic => parse_anthropic_unified_reset(&meta.headers),
                Platform::Openai => parse_openai_codex_windows(&meta.headers).or_else(|| parse_openai_body_reset(&meta.body)),
                Platform::Gemini | Platform::Antigravity => parse_gemini_reset(&meta.body),
            };
            let reset = reset.unwrap_or_else(|| now + Self::platform_fallback(meta.platform));
            account.rate_limit_reset_at = Some(reset);
            if meta.platform == Platform::Anthropic {
                account.session_window = Some(crate::model::SessionWindow {
                    start: reset - chrono::Duration::hours(5),
                    end: reset,
                    status: "rejected".to_string(),
                });
            }
            Transition::RateLimited
        } else if meta.status_code == 529 {
            account.overloaded_until = Some(now + chrono::Duration::from_std(self.config.overload_cooldown).unwrap_or_default());
            Transition::Overloaded
        } else if meta.status_code >= 500 {
            Transition::LoggedOnly
        } else {
            Transition::NoOp
        };

        if matches!(transition, Transition::NoOp | Transition::LoggedOnly) {
            return transition;
        }

        account.updated_at = now;
        let group_ids: Vec<i64> = account.group_ids.iter().copied().collect();
        self.accounts.upsert(account).await;
        self.emit(
            OutboxEventType::AccountChanged,
            Some(meta.account_id),
            None,
            serde_json::json!({ "group_ids": group_ids }),
        )
        .await;

        transition
    }

    /// `status = 5xx` with no custom temp-unschedulable rule match is
    /// log-only and never reaches `record_response`'s write path, but
    /// custom-rule matches (checked by the caller against §4.4-shaped
    /// per-account rules) land here.
    pub async fn apply_temp_unschedulable(&self, account_id: Uuid, duration: Duration, reason: serde_json::Value) {
        let Some(mut account) = self.accounts.get(account_id).await else { return };
        account.temp_unschedulable_until = Some(Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default());
        account.temp_unschedulable_reason = Some(reason);
        account.updated_at = Utc::now();
        let group_ids: Vec<i64> = account.group_ids.iter().copied().collect();
        self.accounts.upsert(account).await;
        self.emit(OutboxEventType::AccountChanged, Some(account_id), None, serde_json::json!({ "group_ids": group_ids })).await;
    }

    /// Per-chunk stream stall counter with a sliding window; once past
    /// threshold either mark `temp_unschedulable` or `status=error`.
    pub async fn record_stream_stall(&self, account_id: Uuid) {
        let count = {
            let mut guard = self.stream_stall_counts.lock().await;
            let entry = guard.entry(account_id).or_insert(0);
            *entry += 1;
            *entry
        };
        if count < self.config.stream_timeout_threshold {
            return;
        }
        self.stream_stall_counts.lock().await.remove(&account_id);

        if self.config.stream_timeout_marks_error {
            if let Some(mut account) = self.accounts.get(account_id).await {
                account.status = AccountStatus::Error;
                account.schedulable = false;
                account.updated_at = Utc::now();
                self.accounts.upsert(account).await;
            }
        } else {
            self.apply_temp_unschedulable(
                account_id,
                self.config.stream_timeout_cooldown,
                serde_json::json!({ "reason": "stream_stall_threshold_exceeded" }),
            )
            .await;
        }
        self.emit(OutboxEventType::AccountChanged, Some(account_id), None, serde_json::json!({})).await;
    }

    fn platform_fallback(platform: Platform) -> chrono::Duration {
        match platform {
            Platform::Openai => chrono::Duration::seconds(300),
            _ => chrono::Duration::seconds(300),
        }
    }

    async fn emit(&self, event_type: OutboxEventType, account_id: Option<Uuid>, group_id: Option<i64>, payload: serde_json::Value) {
        let event = OutboxEvent { id: 0, event_type, account_id, group_id, payload, created_at: Utc::now() };
        self.outbox.append(event).await;
    }
}

/// Daily RPD / per-minute RPM local pre-check for Gemini accounts,
/// aggregated over a one-minute cache TTL. Denies scheduling without
/// contacting the upstream; never marks the account (real 429s remain
/// authoritative).
pub fn gemini_quota_precheck_allows(rate_limit: &crate::model::ModelRateLimit, now: DateTime<Utc>) -> bool {
    if let (Some(limit), started) = (rate_limit.requests_per_minute, rate_limit.minute_window_started_at) {
        let window_fresh = started.is_some_and(|s| (now - s).num_seconds() < 60);
        if window_fresh && rate_limit.minute_window_count >= limit {
            return false;
        }
    }
    if let (Some(limit), started) = (rate_limit.requests_per_day, rate_limit.day_window_started_at) {
        let window_fresh = started.is_some_and(|s| (now - s).num_hours() < 24);
        if window_fresh && rate_limit.day_window_count >= limit {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JsonAccountStore, JsonOutboxStore};
    use std::collections::HashSet;

    async fn account_store_with(account: crate::model::Account) -> Arc<JsonAccountStore> {
        let temp = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonAccountStore::new(temp.path().join("accounts.json")).await);
        store.upsert(account).await;
        store
    }

    fn sample_account(platform: Platform) -> crate::model::Account {
        let now = Utc::now();
        crate::model::Account {
            id: Uuid::new_v4(),
            name: "test".to_string(),
            platform,
            account_type: crate::model::AccountType::ApiKey,
            credentials: crate::model::Credentials::default(),
            status: AccountStatus::Active,
            schedulable: true,
            priority: 0,
            concurrency: 1,
            last_used_at: None,
            rate_limit_reset_at: None,
            overloaded_until: None,
            temp_unschedulable_until: None,
            temp_unschedulable_reason: None,
            session_window: None,
            group_ids: HashSet::from([1]),
            mixed_scheduling_enabled: false,
            custom_error_codes: None,
            model_rate_limits: HashMap::new(),
            temp_unschedulable_rules: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn openai_rate_limit_parses_resets_at_from_body() {
        let account = sample_account(Platform::Openai);
        let id = account.id;
        let store = account_store_with(account).await;
        let outbox = Arc::new(JsonOutboxStore::new(tempfile::tempdir().unwrap().path().join("outbox.json")).await);
        let machine = HealthStateMachine::new(store.clone(), outbox, HealthConfig::default());

        let meta = UpstreamResponseMeta {
            account_id: id,
            platform: Platform::Openai,
            status_code: 429,
            headers: HashMap::new(),
            body: serde_json::json!({ "error": { "type": "usage_limit_reached", "resets_at": 1769404154_i64 } }),
            body_text_lowercase: String::new(),
        };

        let transition = machine.record_response(meta).await;
        assert_eq!(transition, Transition::RateLimited);
        let updated = store.get(id).await.unwrap();
        assert_eq!(updated.rate_limit_reset_at.unwrap().timestamp(), 1769404154);
    }

    #[tokio::test]
    async fn custom_error_codes_not_in_list_is_noop() {
        let mut account = sample_account(Platform::Anthropic);
        account.custom_error_codes = Some(vec![418]);
        let id = account.id;
        let store = account_store_with(account).await;
        let outbox = Arc::new(JsonOutboxStore::new(tempfile::tempdir().unwrap().path().join("outbox.json")).await);
        let machine = HealthStateMachine::new(store.clone(), outbox, HealthConfig::default());

        let meta = UpstreamResponseMeta {
            account_id: id,
            platform: Platform::Anthropic,
            status_code: 401,
            headers: HashMap::new(),
            body: serde_json::json!({}),
            body_text_lowercase: String::new(),
        };

        let transition = machine.record_response(meta).await;
        assert_eq!(transition, Transition::NoOp);
        let unchanged = store.get(id).await.unwrap();
        assert_eq!(unchanged.status, AccountStatus::Active);
    }

    #[tokio::test]
    async fn custom_error_codes_in_list_forces_disabled_regardless_of_status_table() {
        let mut account = sample_account(Platform::Anthropic);
        account.custom_error_codes = Some(vec![429]);
        let id = account.id;
        let store = account_store_with(account).await;
        let outbox = Arc::new(JsonOutboxStore::new(tempfile::tempdir().unwrap().path().join("outbox.json")).await);
        let machine = HealthStateMachine::new(store.clone(), outbox, HealthConfig::default());

        let meta = UpstreamResponseMeta {
            account_id: id,
            platform: Platform::Anthropic,
            status_code: 429,
            headers: HashMap::new(),
            body: serde_json::json!({}),
            body_text_lowercase: String::new(),
        };

        let transition = machine.record_response(meta).await;
        assert_eq!(transition, Transition::Disabled);
        let updated = store.get(id).await.unwrap();
        assert_eq!(updated.status, AccountStatus::Error);
        assert!(!updated.schedulable);
        assert!(updated.rate_limit_reset_at.is_none());
    }

    #[tokio::test]
    async fn overload_sets_cooldown_window() {
        let account = sample_account(Platform::Anthropic);
        let id = account.id;
        let store = account_store_with(account).await;
        let outbox = Arc::new(JsonOutboxStore::new(tempfile::tempdir().unwrap().path().join("outbox.json")).await);
        let machine = HealthStateMachine::new(store.clone(), outbox, HealthConfig::default());

        let meta = UpstreamResponseMeta {
            account_id: id,
            platform: Platform::Anthropic,
            status_code: 529,
            headers: HashMap::new(),
            body: serde_json::json!({}),
            body_text_lowercase: String::new(),
        };
        let transition = machine.record_response(meta).await;
        assert_eq!(transition, Transition::Overloaded);
        let updated = store.get(id).await.unwrap();
        assert!(updated.overloaded_until.unwrap() > Utc::now());
    }
}
