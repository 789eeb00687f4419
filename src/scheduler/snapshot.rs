//! Snapshot rebuild protocol: the outbox poller, per-bucket rebuilds, the
//! lag guard, and fallback admission. See SPEC_FULL.md §4.1.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::model::{
    Account, AccountProjection, BucketKey, OutboxEvent, OutboxEventType, Platform, SchedulerMode,
    SnapshotEntry,
};
use crate::store::{AccountRepository, DistributedCache, SchedulerOutboxRepository};

pub const REBUILD_LOCK_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub outbox_poll_interval: Duration,
    pub full_rebuild_interval: Duration,
    pub lag_warn: Duration,
    pub lag_rebuild: Duration,
    pub lag_rebuild_failures: u32,
    pub backlog_rebuild_rows: i64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            outbox_poll_interval: Duration::from_secs(1),
            full_rebuild_interval: Duration::from_secs(0),
            lag_warn: Duration::from_secs(30),
            lag_rebuild: Duration::from_secs(120),
            lag_rebuild_failures: 3,
            backlog_rebuild_rows: 5_000,
        }
    }
}

pub struct SnapshotService {
    accounts: Arc<dyn AccountRepository>,
    outbox: Arc<dyn SchedulerOutboxRepository>,
    cache: Arc<dyn DistributedCache>,
    config: SnapshotConfig,
    consecutive_lag_ticks: Mutex<u32>,
    known_buckets: Mutex<HashSet<BucketKey>>,
}

impl SnapshotService {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        outbox: Arc<dyn SchedulerOutboxRepository>,
        cache: Arc<dyn DistributedCache>,
        config: SnapshotConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            accounts,
            outbox,
            cache,
            config,
            consecutive_lag_ticks: Mutex::new(0),
            known_buckets: Mutex::new(HashSet::new()),
        })
    }

    pub fn spawn_outbox_worker(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                if let Err(err) = self.poll_once().await {
                    tracing::warn!(error = %err, "outbox poll tick failed");
                }
                tokio::time::sleep(self.config.outbox_poll_interval).await;
            }
        });
    }

    pub fn spawn_full_rebuild_ticker(self: Arc<Self>) {
        if self.config.full_rebuild_interval.is_zero() {
            return;
        }
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.config.full_rebuild_interval).await;
                self.full_rebuild().await;
            }
        });
    }

    /// One outbox poll tick: fetch events above the watermark, dispatch
    /// each, and advance the watermark only after all succeed.
    pub async fn poll_once(&self) -> Result<(), String> {
        self.lag_guard().await;

        let watermark = self.cache.get_watermark().await;
        let events = self.outbox.read_after(watermark, 200).await;
        if events.is_empty() {
            return Ok(());
        }

        let mut max_processed = watermark;
        for event in &events {
            self.dispatch(event).await?;
            max_processed = max_processed.max(event.id);
        }
        self.cache.advance_watermark(max_processed).await;
        Ok(())
    }

    async fn lag_guard(&self) {
        let watermark = self.cache.get_watermark().await;
        let max_id = self.outbox.max_id().await;
        let backlog = max_id - watermark;

        if backlog <= 0 {
            *self.consecutive_lag_ticks.lock().await = 0;
            return;
        }

        if backlog >= self.config.backlog_rebuild_rows {
            tracing::warn!(backlog, "outbox backlog rebuild threshold exceeded, forcing full rebuild");
            self.full_rebuild().await;
            *self.consecutive_lag_ticks.lock().await = 0;
            return;
        }

        let mut ticks = self.consecutive_lag_ticks.lock().await;
        *ticks += 1;
        if *ticks >= self.config.lag_rebuild_failures {
            tracing::warn!(backlog, ticks = *ticks, "outbox lag exceeded rebuild threshold for N ticks, forcing full rebuild");
            drop(ticks);
            self.full_rebuild().await;
            *self.consecutive_lag_ticks.lock().await = 0;
        } else {
            tracing::info!(backlog, "outbox lag warning");
        }
    }

    async fn dispatch(&self, event: &OutboxEvent) -> Result<(), String> {
        match event.event_type {
            OutboxEventType::AccountLastUsed => {
                self.apply_last_used_payload(&event.payload).await;
            }
            OutboxEventType::AccountChanged | OutboxEventType::AccountGroupsChanged => {
                if let Some(account_id) = event.account_id {
                    self.reload_single_account(account_id).await;
                }
            }
            OutboxEventType::AccountBulkChanged => {
                if let Some(ids) = event.payload.get("account_ids").and_then(|v| v.as_array()) {
                    for id_value in ids {
                        if let Some(id_str) = id_value.as_str() {
                            if let Ok(id) = uuid::Uuid::parse_str(id_str) {
                                self.reload_single_account(id).await;
                            }
                        }
                    }
                }
            }
            OutboxEventType::GroupChanged => {
                if let Some(group_id) = event.group_id {
                    self.rebuild_group_buckets(group_id).await;
                }
            }
            OutboxEventType::FullRebuild => {
                self.full_rebuild().await;
            }
        }
        Ok(())
    }

    async fn apply_last_used_payload(&self, payload: &serde_json::Value) {
        let Some(map) = payload.get("last_used").and_then(|v| v.as_object()) else {
            return;
        };
        for (id_str, ts) in map {
            let (Ok(id), Some(secs)) = (uuid::Uuid::parse_str(id_str), ts.as_i64()) else {
                continue;
            };
            if let Some(mut projection) = self.cache.get_account_projection(id).await {
                projection.last_used_at = chrono::DateTime::from_timestamp(secs, 0);
                self.cache.put_account_projection(projection).await;
            }
        }
    }

    async fn reload_single_account(&self, account_id: uuid::Uuid) {
        match self.accounts.get(account_id).await {
            None => self.cache.delete_account_projection(account_id).await,
            Some(account) => {
                self.cache.put_account_projection(AccountProjection::from(&account)).await;
                let mut buckets_to_rebuild: HashSet<BucketKey> = HashSet::new();
                for &group_id in &account.group_ids {
                    for mode in [SchedulerMode::Single, SchedulerMode::Mixed, SchedulerMode::Forced] {
                        buckets_to_rebuild.insert(BucketKey { group_id, platform: account.platform, mode });
                    }
                    if account.platform == Platform::Antigravity && account.mixed_scheduling_enabled {
                        buckets_to_rebuild.insert(BucketKey { group_id, platform: Platform::Anthropic, mode: SchedulerMode::Mixed });
                        buckets_to_rebuild.insert(BucketKey { group_id, platform: Platform::Gemini, mode: SchedulerMode::Mixed });
                    }
                }
                for key in buckets_to_rebuild {
                    self.rebuild_bucket(key).await;
                }
            }
        }
    }

    async fn rebuild_group_buckets(&self, group_id: i64) {
        let known = self.known_buckets.lock().await.clone();
        for key in known.into_iter().filter(|k| k.group_id == group_id) {
            self.rebuild_bucket(key).await;
        }
        for platform in [Platform::Anthropic, Platform::Openai, Platform::Gemini, Platform::Antigravity] {
            for mode in [SchedulerMode::Single, SchedulerMode::Mixed, SchedulerMode::Forced] {
                self.rebuild_bucket(BucketKey { group_id, platform, mode }).await;
            }
        }
    }

    pub async fn full_rebuild(&self) {
        let known = self.known_buckets.lock().await.clone();
        let keys = if known.is_empty() {
            self.cache.known_bucket_keys().await
        } else {
            known.into_iter().collect()
        };
        for key in keys {
            self.rebuild_bucket(key).await;
        }
    }

    /// Acquire the per-bucket rebuild lock (probe-and-skip, no blocking),
    /// load eligible accounts, and publish a fresh snapshot.
    pub async fn rebuild_bucket(&self, key: BucketKey) -> bool {
        let lock_name = format!("{}:{}:{:?}", key.group_id, key.platform.as_str(), key.mode);
        if !self.cache.try_acquire_rebuild_lock(&lock_name, REBUILD_LOCK_TTL).await {
            return false;
        }

        let mixed_antigravity = key.mode == SchedulerMode::Mixed
            && matches!(key.platform, Platform::Anthropic | Platform::Gemini);
        let accounts: Vec<Account> = self
            .accounts
            .list_by_platform_group_schedulable(key.platform, key.group_id, mixed_antigravity)
            .await;

        let projections: Vec<AccountProjection> = accounts.iter().map(AccountProjection::from).collect();
        let entry = SnapshotEntry { accounts: projections, last_built_at: Utc::now() };
        self.cache.put_bucket_snapshot(key, entry).await;
        self.known_buckets.lock().await.insert(key);

        self.cache.release_rebuild_lock(&lock_name).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InProcessDistributedCache, JsonAccountStore, JsonOutboxStore};

    #[tokio::test]
    async fn rebuilding_same_bucket_twice_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let accounts = Arc::new(JsonAccountStore::new(temp.path().join("accounts.json")).await);
        let outbox = Arc::new(JsonOutboxStore::new(temp.path().join("outbox.json")).await);
        let cache = InProcessDistributedCache::new();

        let service = SnapshotService::new(accounts.clone(), outbox, cache.clone(), SnapshotConfig::default());
        let key = BucketKey { group_id: 1, platform: Platform::Anthropic, mode: SchedulerMode::Single };

        assert!(service.rebuild_bucket(key).await);
        let first = cache.get_bucket_snapshot(key).await.unwrap();
        assert!(service.rebuild_bucket(key).await);
        let second = cache.get_bucket_snapshot(key).await.unwrap();

        assert_eq!(first.accounts.len(), second.accounts.len());
    }
}
