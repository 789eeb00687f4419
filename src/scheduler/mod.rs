//! Account Scheduler & Snapshot Cache. See SPEC_FULL.md §4.1.
//!
//! Grounded in `provider_health::ModelChainStore::resolve_chain` (the
//! candidate-gathering shape) and `ai_providers::AIProviderStore` (the
//! account projection fields), generalized to sticky sessions, ranking,
//! load-awareness, and concurrency slots.

mod snapshot;

pub use snapshot::{SnapshotConfig, SnapshotService, REBUILD_LOCK_TTL};

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::model::{AccountProjection, AccountType, BucketKey, Platform, SchedulerMode};
use crate::store::{AccountRepository, DistributedCache};

#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub group_id: Option<i64>,
    pub platform: Platform,
    pub forced_platform: Option<Platform>,
    pub session_hash: Option<String>,
    pub requested_model: String,
    pub exclusions: HashSet<Uuid>,
    /// Set only for the AI-Studio-shaped OpenAI rank variant.
    pub is_ai_studio_endpoint: bool,
}

#[derive(Debug)]
pub enum SelectionOutcome {
    Selected(AccountProjection, Option<SlotGuard>),
    WaitPlan { account: AccountProjection, estimated_wait: Duration },
}

/// Reciprocal with the distributed cache's `acquire_slot`; holding this
/// keeps the in-flight counter incremented for the duration of the
/// attempt. Dropping it always releases, even when the holder returns
/// early via `?` or panics, per SPEC_FULL.md §5 "A release must execute
/// even on panic/error." Async `Drop` doesn't exist, so release is
/// fire-and-forget on a spawned task rather than inline.
pub struct SlotGuard {
    cache: Arc<dyn DistributedCache>,
    account_id: Uuid,
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard").field("account_id", &self.account_id).finish()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let cache = self.cache.clone();
        let account_id = self.account_id;
        tokio::spawn(async move { cache.release_slot(account_id).await });
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub db_fallback_enabled: bool,
    pub db_fallback_max_qps: u32,
    pub db_fallback_timeout: Duration,
    pub max_concurrency_switches: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            db_fallback_enabled: false,
            db_fallback_max_qps: 5,
            db_fallback_timeout: Duration::from_millis(500),
            max_concurrency_switches: 3,
        }
    }
}

struct TokenBucket {
    capacity: u32,
    count: AtomicU32,
    window_started: Mutex<Instant>,
}

impl TokenBucket {
    fn new(capacity: u32) -> Self {
        Self { capacity, count: AtomicU32::new(0), window_started: Mutex::new(Instant::now()) }
    }

    async fn try_acquire(&self) -> bool {
        let mut started = self.window_started.lock().await;
        if started.elapsed() >= Duration::from_secs(1) {
            *started = Instant::now();
            self.count.store(0, Ordering::SeqCst);
        }
        let prev = self.count.fetch_add(1, Ordering::SeqCst);
        prev < self.capacity
    }
}

pub struct Scheduler {
    accounts: Arc<dyn AccountRepository>,
    cache: Arc<dyn DistributedCache>,
    config: SchedulerConfig,
    fallback_bucket: TokenBucket,
}

impl Scheduler {
    pub fn new(accounts: Arc<dyn AccountRepository>, cache: Arc<dyn DistributedCache>, config: SchedulerConfig) -> Self {
        let capacity = config.db_fallback_max_qps;
        Self { accounts, cache, config, fallback_bucket: TokenBucket::new(capacity) }
    }

    fn resolve_mode(&self, request: &SelectionRequest) -> (SchedulerMode, Platform) {
        if let Some(forced) = request.forced_platform {
            return (SchedulerMode::Forced, forced);
        }
        if matches!(request.platform, Platform::Anthropic | Platform::Gemini) {
            return (SchedulerMode::Mixed, request.platform);
        }
        (SchedulerMode::Single, request.platform)
    }

    pub async fn select_account(&self, request: SelectionRequest) -> Result<SelectionOutcome, GatewayError> {
        let group_id = request.group_id.unwrap_or(0);
        let (mode, platform) = self.resolve_mode(&request);
        let now = Utc::now();

        // Step 2: sticky attempt.
        if let Some(hash) = request.session_hash.as_deref().filter(|h| !h.is_empty()) {
            if let Some(account_id) = self.cache.get_session_binding(group_id, hash).await {
                if !request.exclusions.contains(&account_id) {
                    if let Some(projection) = self.cache.get_account_projection(account_id).await {
                        if self.projection_is_eligible(&projection, &request, now) {
                            self.cache
                                .put_session_binding(group_id, hash, account_id, crate::model::SESSION_BINDING_TTL)
                                .await;
                            self.note_last_used(account_id).await;
                            return Ok(SelectionOutcome::Selected(projection, None));
                        }
                    }
                }
                self.cache.delete_session_binding(group_id, hash).await;
            }
        }

        // Step 3/4: candidate set, ranking.
        let bucket_key = BucketKey { group_id, platform, mode };
        let mut candidates = self.load_candidates(bucket_key, &request, now).await?;
        self.rank(&mut candidates, platform, &request);

        // Step 5: load-aware variant — rank()'s priority/LRU order is kept
        // as the tiebreak, but candidates are tried lowest-load-first so a
        // lightly-loaded lower-priority account isn't starved behind a
        // saturated higher-priority one.
        let mut load_rates = std::collections::HashMap::with_capacity(candidates.len());
        for candidate in &candidates {
            let in_flight = self.cache.in_flight(candidate.id).await;
            let rate = in_flight as f64 / candidate.concurrency.max(1) as f64;
            load_rates.insert(candidate.id, rate);
        }
        candidates.sort_by(|a, b| {
            load_rates[&a.id]
                .partial_cmp(&load_rates[&b.id])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Step 6: concurrency slot acquisition. `max_concurrency_switches`
        // only bounds how many candidates we probe per call; it no longer
        // decides whether the caller waits — that's load_rates below.
        let mut switches = 0;
        for candidate in &candidates {
            if self.cache.acquire_slot(candidate.id, candidate.concurrency.max(1)).await {
                if let Some(hash) = request.session_hash.as_deref().filter(|h| !h.is_empty()) {
                    self.cache.put_session_binding(group_id, hash, candidate.id, crate::model::SESSION_BINDING_TTL).await;
                }
                self.note_last_used(candidate.id).await;
                let guard = SlotGuard { cache: self.cache.clone(), account_id: candidate.id };
                return Ok(SelectionOutcome::Selected(candidate.clone(), Some(guard)));
            }
            switches += 1;
            if switches >= self.config.max_concurrency_switches {
                break;
            }
        }

        if let Some(first) = candidates.first() {
            let all_saturated = candidates.iter().all(|c| load_rates.get(&c.id).copied().unwrap_or(0.0) >= 1.0);
            let estimated_wait = if all_saturated { Duration::from_secs(1) } else { Duration::from_millis(250) };
            return Ok(SelectionOutcome::WaitPlan { account: first.clone(), estimated_wait });
        }

        Err(GatewayError::no_available_accounts_supporting_model(&request.requested_model))
    }

    async fn load_candidates(
        &self,
        key: BucketKey,
        request: &SelectionRequest,
        now: chrono::DateTime<Utc>,
    ) -> Result<Vec<AccountProjection>, GatewayError> {
        let snapshot = self.cache.get_bucket_snapshot(key).await;

        let accounts = match snapshot {
            Some(entry) => entry.accounts,
            None if self.config.db_fallback_enabled => {
                if !self.fallback_bucket.try_acquire().await {
                    return Err(GatewayError::scheduler_db_fallback_limited());
                }
                let mixed_antigravity = key.mode == SchedulerMode::Mixed
                    && matches!(key.platform, Platform::Anthropic | Platform::Gemini);
                let loaded = tokio::time::timeout(
                    self.config.db_fallback_timeout,
                    self.accounts.list_by_platform_group_schedulable(key.platform, key.group_id, mixed_antigravity),
                )
                .await
                .map_err(|_| GatewayError::scheduler_cache_not_ready())?;
                loaded.iter().map(AccountProjection::from).collect()
            }
            None => return Err(GatewayError::scheduler_cache_not_ready()),
        };

        Ok(accounts
            .into_iter()
            .filter(|p| !request.exclusions.contains(&p.id))
            .filter(|p| self.platform_matches_mode(p, key.platform, key.mode))
            .filter(|p| self.gemini_quota_precheck_clears(p, request, now))
            .filter(|p| self.projection_cooldowns_clear(p, now))
            .collect())
    }

    /// Local RPD/RPM precheck for Gemini-family accounts (spec §4 "Account
    /// Scheduler" — quota precheck). A denial here only skips the account
    /// from this selection; it does not mark it unschedulable, since real
    /// upstream 429s remain the authoritative signal.
    fn gemini_quota_precheck_clears(&self, projection: &AccountProjection, request: &SelectionRequest, now: chrono::DateTime<Utc>) -> bool {
        if !matches!(projection.platform, Platform::Gemini | Platform::Antigravity) {
            return true;
        }
        match projection.model_rate_limits.get(&request.requested_model) {
            Some(limit) => crate::health::gemini_quota_precheck_allows(limit, now),
            None => true,
        }
    }

    fn platform_matches_mode(&self, projection: &AccountProjection, platform: Platform, mode: SchedulerMode) -> bool {
        if projection.platform == platform {
            return true;
        }
        mode == SchedulerMode::Mixed
            && projection.platform == Platform::Antigravity
            && projection.mixed_scheduling_enabled
    }

    fn projection_cooldowns_clear(&self, _projection: &AccountProjection, _now: chrono::DateTime<Utc>) -> bool {
        // The snapshot only ever contains accounts the health state machine
        // considered schedulable at rebuild time; per-request recency is
        // enforced again here defensively once cooldown timestamps are
        // carried on the projection by a richer store.
        true
    }

    fn projection_is_eligible(&self, projection: &AccountProjection, request: &SelectionRequest, now: chrono::DateTime<Utc>) -> bool {
        self.platform_matches_mode(projection, request.platform, self.resolve_mode(request).0)
            && self.projection_cooldowns_clear(projection, now)
    }

    async fn note_last_used(&self, account_id: Uuid) {
        // Coalesced in the real system into a periodic flush (§4.3
        // "Outbox coupling"); the health state machine owns that batching.
        if let Some(mut projection) = self.cache.get_account_projection(account_id).await {
            projection.last_used_at = Some(Utc::now());
            self.cache.put_account_projection(projection).await;
        }
    }

    /// Step 4 ranking: lower `priority` wins; ties broken by LRU and
    /// platform-specific OAuth/api-key preference.
    fn rank(&self, candidates: &mut [AccountProjection], platform: Platform, request: &SelectionRequest) {
        if platform == Platform::Openai {
            candidates.sort_by(|a, b| self.openai_rank(a, request).cmp(&self.openai_rank(b, request)));
            return;
        }
        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| match (a.last_used_at, b.last_used_at) {
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (None, None) => self.oauth_tiebreak(a, b, platform),
                    (Some(x), Some(y)) => x.cmp(&y),
                })
        });
    }

    fn oauth_tiebreak(&self, a: &AccountProjection, b: &AccountProjection, platform: Platform) -> std::cmp::Ordering {
        if !matches!(platform, Platform::Gemini | Platform::Antigravity) {
            return std::cmp::Ordering::Equal;
        }
        let rank = |p: &AccountProjection| if p.account_type == AccountType::Oauth { 0 } else { 1 };
        rank(a).cmp(&rank(b))
    }

    fn openai_rank(&self, p: &AccountProjection, request: &SelectionRequest) -> u8 {
        if !request.is_ai_studio_endpoint {
            return match p.account_type {
                AccountType::ApiKey => 0,
                AccountType::Oauth | AccountType::Upstream => 1,
            };
        }
        match p.account_type {
            AccountType::ApiKey => 0,
            AccountType::Oauth if p.credentials.project_id.is_none() => 1,
            AccountType::Oauth if p.credentials.oauth_type.as_deref() == Some("ai_studio") => 2,
            AccountType::Oauth => 3,
            AccountType::Upstream => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Credentials};
    use crate::store::InProcessDistributedCache;

    fn projection(id: Uuid, priority: i32, platform: Platform, last_used_at: Option<chrono::DateTime<Utc>>) -> AccountProjection {
        AccountProjection {
            id,
            platform,
            account_type: AccountType::ApiKey,
            priority,
            last_used_at,
            credentials: Credentials::default(),
            mixed_scheduling_enabled: false,
            group_ids: HashSet::from([1]),
            concurrency: 4,
            model_rate_limits: std::collections::HashMap::new(),
        }
    }

    #[tokio::test]
    async fn sticky_session_returns_same_account_twice() {
        let cache = InProcessDistributedCache::new();
        let accounts = Arc::new(crate::store::JsonAccountStore::new(
            tempfile::tempdir().unwrap().path().join("accounts.json"),
        ).await);
        let scheduler = Scheduler::new(accounts, cache.clone(), SchedulerConfig::default());

        let a_id = Uuid::new_v4();
        let a = projection(a_id, 0, Platform::Anthropic, None);
        cache.put_account_projection(a.clone()).await;
        cache.put_bucket_snapshot(
            BucketKey { group_id: 1, platform: Platform::Anthropic, mode: SchedulerMode::Mixed },
            crate::model::SnapshotEntry { accounts: vec![a], last_built_at: Utc::now() },
        ).await;

        let request = SelectionRequest {
            group_id: Some(1),
            platform: Platform::Anthropic,
            forced_platform: None,
            session_hash: Some("sess-1".to_string()),
            requested_model: "claude-3".to_string(),
            exclusions: HashSet::new(),
            is_ai_studio_endpoint: false,
        };

        let first = scheduler.select_account(request.clone()).await.unwrap();
        let first_id = match first {
            SelectionOutcome::Selected(p, _) => p.id,
            _ => panic!("expected selection"),
        };
        assert_eq!(first_id, a_id);

        let second = scheduler.select_account(request).await.unwrap();
        let second_id = match second {
            SelectionOutcome::Selected(p, _) => p.id,
            _ => panic!("expected selection"),
        };
        assert_eq!(second_id, a_id);
    }

    #[tokio::test]
    async fn lower_priority_wins_ranking() {
        let cache = InProcessDistributedCache::new();
        let accounts = Arc::new(crate::store::JsonAccountStore::new(
            tempfile::tempdir().unwrap().path().join("accounts.json"),
        ).await);
        let scheduler = Scheduler::new(accounts, cache.clone(), SchedulerConfig::default());

        let low = projection(Uuid::new_v4(), 5, Platform::Anthropic, None);
        let high = projection(Uuid::new_v4(), 0, Platform::Anthropic, None);
        let mut candidates = vec![low.clone(), high.clone()];
        scheduler.rank(&mut candidates, Platform::Anthropic, &SelectionRequest {
            group_id: Some(1),
            platform: Platform::Anthropic,
            forced_platform: None,
            session_hash: None,
            requested_model: "m".to_string(),
            exclusions: HashSet::new(),
            is_ai_studio_endpoint: false,
        });
        assert_eq!(candidates[0].id, high.id);
    }

    #[tokio::test]
    async fn least_loaded_candidate_is_preferred_over_higher_priority_saturated_one() {
        let cache = InProcessDistributedCache::new();
        let accounts = Arc::new(crate::store::JsonAccountStore::new(
            tempfile::tempdir().unwrap().path().join("accounts.json"),
        ).await);
        let scheduler = Scheduler::new(accounts, cache.clone(), SchedulerConfig::default());

        let mut busy = projection(Uuid::new_v4(), 0, Platform::Anthropic, None);
        busy.concurrency = 1;
        let idle = projection(Uuid::new_v4(), 5, Platform::Anthropic, None);
        cache.put_account_projection(busy.clone()).await;
        cache.put_account_projection(idle.clone()).await;
        cache.put_bucket_snapshot(
            BucketKey { group_id: 1, platform: Platform::Anthropic, mode: SchedulerMode::Mixed },
            crate::model::SnapshotEntry { accounts: vec![busy.clone(), idle.clone()], last_built_at: Utc::now() },
        ).await;
        assert!(cache.acquire_slot(busy.id, busy.concurrency.max(1)).await);

        let request = SelectionRequest {
            group_id: Some(1),
            platform: Platform::Anthropic,
            forced_platform: None,
            session_hash: None,
            requested_model: "m".to_string(),
            exclusions: HashSet::new(),
            is_ai_studio_endpoint: false,
        };

        let outcome = scheduler.select_account(request).await.unwrap();
        let selected_id = match outcome {
            SelectionOutcome::Selected(p, _) => p.id,
            other => panic!("expected selection, got {other:?}"),
        };
        assert_eq!(selected_id, idle.id, "fully-loaded account must lose to an idle lower-priority one");
    }

    #[tokio::test]
    async fn gemini_account_over_rpm_quota_is_skipped_not_marked() {
        let cache = InProcessDistributedCache::new();
        let accounts = Arc::new(crate::store::JsonAccountStore::new(
            tempfile::tempdir().unwrap().path().join("accounts.json"),
        ).await);
        let scheduler = Scheduler::new(accounts, cache.clone(), SchedulerConfig::default());

        let mut exhausted = projection(Uuid::new_v4(), 0, Platform::Gemini, None);
        exhausted.model_rate_limits.insert(
            "gemini-2.5-pro".to_string(),
            crate::model::ModelRateLimit {
                requests_per_minute: Some(10),
                requests_per_day: None,
                minute_window_count: 10,
                day_window_count: 0,
                minute_window_started_at: Some(Utc::now()),
                day_window_started_at: None,
            },
        );
        let fresh = projection(Uuid::new_v4(), 0, Platform::Gemini, None);
        cache.put_account_projection(exhausted.clone()).await;
        cache.put_account_projection(fresh.clone()).await;
        cache.put_bucket_snapshot(
            BucketKey { group_id: 1, platform: Platform::Gemini, mode: SchedulerMode::Mixed },
            crate::model::SnapshotEntry { accounts: vec![exhausted.clone(), fresh.clone()], last_built_at: Utc::now() },
        ).await;

        let request = SelectionRequest {
            group_id: Some(1),
            platform: Platform::Gemini,
            forced_platform: None,
            session_hash: None,
            requested_model: "gemini-2.5-pro".to_string(),
            exclusions: HashSet::new(),
            is_ai_studio_endpoint: false,
        };

        let outcome = scheduler.select_account(request).await.unwrap();
        let selected_id = match outcome {
            SelectionOutcome::Selected(p, _) => p.id,
            other => panic!("expected selection, got {other:?}"),
        };
        assert_eq!(selected_id, fresh.id, "quota-exhausted account must be skipped in favor of the fresh one");

        // The precheck only narrows candidates for this selection; it never
        // touches the account's own schedulable/status fields.
        let still_cached = cache.get_account_projection(exhausted.id).await.unwrap();
        assert!(still_cached.model_rate_limits["gemini-2.5-pro"].minute_window_count >= 10);
    }
}
