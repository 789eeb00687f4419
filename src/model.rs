//! Core data model: accounts, groups, scheduler buckets, snapshots, the
//! outbox log, session bindings, error-passthrough rules, and retry
//! attempts. See SPEC_FULL.md §3.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Anthropic,
    Openai,
    Gemini,
    Antigravity,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Anthropic => "anthropic",
            Platform::Openai => "openai",
            Platform::Gemini => "gemini",
            Platform::Antigravity => "antigravity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Oauth,
    ApiKey,
    Upstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Disabled,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    Single,
    Mixed,
    Forced,
}

/// Opaque upstream credential bag. Every field is optional since the set
/// actually populated depends on `account_type` and `platform`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chatgpt_account_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: String,
}

/// Per-model rate-limit bookkeeping, keyed by model id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRateLimit {
    pub requests_per_minute: Option<u32>,
    pub requests_per_day: Option<u32>,
    pub minute_window_count: u32,
    pub day_window_count: u32,
    pub minute_window_started_at: Option<DateTime<Utc>>,
    pub day_window_started_at: Option<DateTime<Utc>>,
}

/// Fingerprint of one upstream credential, with scheduling metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    pub platform: Platform,
    pub account_type: AccountType,
    pub credentials: Credentials,
    pub status: AccountStatus,
    pub schedulable: bool,
    /// Lower is preferred.
    pub priority: i32,
    pub concurrency: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub overloaded_until: Option<DateTime<Utc>>,
    pub temp_unschedulable_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_unschedulable_reason: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_window: Option<SessionWindow>,
    pub group_ids: HashSet<i64>,
    pub mixed_scheduling_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_error_codes: Option<Vec<u16>>,
    #[serde(default)]
    pub model_rate_limits: HashMap<String, ModelRateLimit>,
    /// Keyword/status rules identical in shape to ErrorPassthroughRule but
    /// kept account-local per SPEC_FULL.md §9 Open Question resolution.
    #[serde(default)]
    pub temp_unschedulable_rules: Vec<TempUnschedulableRule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// `schedulable ⇒ status = active ∧ all cooldowns expired`.
    pub fn is_currently_schedulable(&self, now: DateTime<Utc>) -> bool {
        if !self.schedulable || self.status != AccountStatus::Active {
            return false;
        }
        if self.rate_limit_reset_at.is_some_and(|t| t > now) {
            return false;
        }
        if self.overloaded_until.is_some_and(|t| t > now) {
            return false;
        }
        if self.temp_unschedulable_until.is_some_and(|t| t > now) {
            return false;
        }
        true
    }

    pub fn supports_model(&self, _model: &str) -> bool {
        // Per-platform capability check. Every account is assumed to
        // support every model of its own platform; platform-specific
        // stores narrow this with a custom_models allowlist when one is
        // configured. Kept permissive here since model catalogs are an
        // external collaborator.
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TempUnschedulableRule {
    pub error_codes: Vec<u16>,
    pub keywords: Vec<String>,
    pub match_mode: MatchMode,
    pub duration_minutes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Any,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    Subscription,
    PayAsYouGo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub platform: Platform,
    pub subscription_type: SubscriptionType,
    #[serde(default)]
    pub image_tier_prices: HashMap<String, f64>,
    pub fallback_group_id_on_invalid_request: Option<i64>,
    #[serde(default)]
    pub usage_limits: UsageLimits,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageLimits {
    pub daily: Option<f64>,
    pub weekly: Option<f64>,
    pub monthly: Option<f64>,
}

impl Group {
    /// Only a non-subscription anthropic-platform group may be a fallback
    /// target, and only anthropic/antigravity groups may set one.
    pub fn may_set_fallback(&self) -> bool {
        matches!(self.platform, Platform::Anthropic | Platform::Antigravity)
    }

    pub fn is_valid_fallback_target(&self) -> bool {
        self.platform == Platform::Anthropic && self.subscription_type == SubscriptionType::PayAsYouGo
    }
}

/// `(group_id, platform, mode)` cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub group_id: i64,
    pub platform: Platform,
    pub mode: SchedulerMode,
}

/// Immutable projection of an `Account` held in the snapshot. Rebuilds
/// publish a new value rather than mutating one in place (SPEC_FULL.md §9
/// "Arena/indexing for the snapshot").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountProjection {
    pub id: Uuid,
    pub platform: Platform,
    pub account_type: AccountType,
    pub priority: i32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub credentials: Credentials,
    pub mixed_scheduling_enabled: bool,
    pub group_ids: HashSet<i64>,
    pub concurrency: u32,
    #[serde(default)]
    pub model_rate_limits: HashMap<String, ModelRateLimit>,
}

impl From<&Account> for AccountProjection {
    fn from(a: &Account) -> Self {
        Self {
            id: a.id,
            platform: a.platform,
            account_type: a.account_type,
            priority: a.priority,
            last_used_at: a.last_used_at,
            credentials: a.credentials.clone(),
            mixed_scheduling_enabled: a.mixed_scheduling_enabled,
            group_ids: a.group_ids.clone(),
            concurrency: a.concurrency,
            model_rate_limits: a.model_rate_limits.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub accounts: Vec<AccountProjection>,
    pub last_built_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxEventType {
    AccountChanged,
    AccountBulkChanged,
    AccountGroupsChanged,
    AccountLastUsed,
    GroupChanged,
    FullRebuild,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: i64,
    pub event_type: OutboxEventType,
    pub account_id: Option<Uuid>,
    pub group_id: Option<i64>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionBindingKey {
    pub group_id: i64,
    pub session_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionBinding {
    pub account_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

pub const SESSION_BINDING_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPassthroughRule {
    pub id: i64,
    pub name: String,
    pub priority: i64,
    pub enabled: bool,
    /// Empty means "all platforms".
    pub platforms: Vec<String>,
    pub error_codes: Vec<u16>,
    pub keywords: Vec<String>,
    pub match_mode: MatchMode,
    pub passthrough_code: bool,
    pub response_code: Option<u16>,
    pub passthrough_body: bool,
    pub custom_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    Client,
    Upstream,
    UpstreamEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryAttemptStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub id: Uuid,
    pub source_error_id: Uuid,
    pub mode: RetryMode,
    pub pinned_account_id: Option<Uuid>,
    pub status: RetryAttemptStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub http_status: Option<u16>,
    pub upstream_request_id: Option<String>,
    pub used_account_id: Option<Uuid>,
    pub response_preview: Option<String>,
    pub response_truncated: bool,
    pub error_message: Option<String>,
}

/// A stored failed request, replayable by the Operational Retry engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceError {
    pub id: Uuid,
    pub group_id: i64,
    pub platform: Platform,
    pub model: String,
    pub path: String,
    pub upstream_method: String,
    /// Allowlisted headers only: never auth.
    pub headers: HashMap<String, String>,
    pub body: serde_json::Value,
    pub original_account_id: Uuid,
    pub upstream_errors: Vec<UpstreamErrorAttempt>,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamErrorAttempt {
    pub account_id: Uuid,
    pub upstream_request_body: serde_json::Value,
    pub http_status: Option<u16>,
}

/// Wall-clock instant recorded at scheduling time; distinct from the
/// monotonic `Instant` used for in-process cooldown math.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicStamp(pub Instant);
