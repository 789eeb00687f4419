use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::model::{AccountProjection, BucketKey, SnapshotEntry};

use super::DistributedCache;

struct SessionEntry {
    account_id: Uuid,
    expires_at: Instant,
}

/// Single-instance stand-in for the spec's Redis-shaped distributed cache.
/// Grounded in `api::proxy::GOOGLE_PROJECT_CACHE`'s `OnceLock<RwLock<...>>`
/// shape, generalized to the several pieces of state §5 "Shared-resource
/// policy" assigns to the distributed cache.
pub struct InProcessDistributedCache {
    watermark: AtomicI64,
    rebuild_locks: Mutex<HashMap<String, Instant>>,
    session_bindings: Mutex<HashMap<(i64, String), SessionEntry>>,
    in_flight: Mutex<HashMap<Uuid, u32>>,
    bucket_snapshots: Mutex<HashMap<BucketKey, SnapshotEntry>>,
    account_projections: Mutex<HashMap<Uuid, AccountProjection>>,
}

impl InProcessDistributedCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Default for InProcessDistributedCache {
    fn default() -> Self {
        Self {
            watermark: AtomicI64::new(0),
            rebuild_locks: Mutex::new(HashMap::new()),
            session_bindings: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            bucket_snapshots: Mutex::new(HashMap::new()),
            account_projections: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl DistributedCache for InProcessDistributedCache {
    async fn get_watermark(&self) -> i64 {
        self.watermark.load(Ordering::SeqCst)
    }

    async fn advance_watermark(&self, to: i64) {
        self.watermark.fetch_max(to, Ordering::SeqCst);
    }

    async fn try_acquire_rebuild_lock(&self, bucket: &str, ttl: Duration) -> bool {
        let mut guard = self.rebuild_locks.lock().await;
        let now = Instant::now();
        if let Some(expires_at) = guard.get(bucket) {
            if *expires_at > now {
                return false;
            }
        }
        guard.insert(bucket.to_string(), now + ttl);
        true
    }

    async fn release_rebuild_lock(&self, bucket: &str) {
        self.rebuild_locks.lock().await.remove(bucket);
    }

    async fn get_session_binding(&self, group_id: i64, session_hash: &str) -> Option<Uuid> {
        let mut guard = self.session_bindings.lock().await;
        let key = (group_id, session_hash.to_string());
        match guard.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.account_id),
            Some(_) => {
                guard.remove(&key);
                None
            }
            None => None,
        }
    }

    async fn put_session_binding(&self, group_id: i64, session_hash: &str, account_id: Uuid, ttl: Duration) {
        let mut guard = self.session_bindings.lock().await;
        guard.insert(
            (group_id, session_hash.to_string()),
            SessionEntry { account_id, expires_at: Instant::now() + ttl },
        );
    }

    async fn delete_session_binding(&self, group_id: i64, session_hash: &str) {
        self.session_bindings.lock().await.remove(&(group_id, session_hash.to_string()));
    }

    async fn acquire_slot(&self, account_id: Uuid, max_concurrency: u32) -> bool {
        let mut guard = self.in_flight.lock().await;
        let current = guard.entry(account_id).or_insert(0);
        if *current >= max_concurrency {
            return false;
        }
        *current += 1;
        true
    }

    async fn release_slot(&self, account_id: Uuid) {
        let mut guard = self.in_flight.lock().await;
        if let Some(current) = guard.get_mut(&account_id) {
            *current = current.saturating_sub(1);
        }
    }

    async fn in_flight(&self, account_id: Uuid) -> u32 {
        *self.in_flight.lock().await.get(&account_id).unwrap_or(&0)
    }

    async fn get_bucket_snapshot(&self, key: BucketKey) -> Option<SnapshotEntry> {
        self.bucket_snapshots.lock().await.get(&key).cloned()
    }

    async fn put_bucket_snapshot(&self, key: BucketKey, entry: SnapshotEntry) {
        self.bucket_snapshots.lock().await.insert(key, entry);
    }

    async fn known_bucket_keys(&self) -> Vec<BucketKey> {
        self.bucket_snapshots.lock().await.keys().copied().collect()
    }

    async fn get_account_projection(&self, id: Uuid) -> Option<AccountProjection> {
        self.account_projections.lock().await.get(&id).cloned()
    }

    async fn put_account_projection(&self, projection: AccountProjection) {
        self.account_projections.lock().await.insert(projection.id, projection);
    }

    async fn delete_account_projection(&self, id: Uuid) {
        self.account_projections.lock().await.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rebuild_lock_is_exclusive_until_ttl_expires() {
        let cache = InProcessDistributedCache::new();
        assert!(cache.try_acquire_rebuild_lock("bucket-1", Duration::from_millis(20)).await);
        assert!(!cache.try_acquire_rebuild_lock("bucket-1", Duration::from_millis(20)).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.try_acquire_rebuild_lock("bucket-1", Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn concurrency_slot_acquire_release_pair() {
        let cache = InProcessDistributedCache::new();
        let id = Uuid::new_v4();
        assert!(cache.acquire_slot(id, 1).await);
        assert!(!cache.acquire_slot(id, 1).await);
        cache.release_slot(id).await;
        assert!(cache.acquire_slot(id, 1).await);
    }

    #[tokio::test]
    async fn session_binding_expires_after_ttl() {
        let cache = InProcessDistributedCache::new();
        let id = Uuid::new_v4();
        cache.put_session_binding(1, "sess-1", id, Duration::from_millis(20)).await;
        assert_eq!(cache.get_session_binding(1, "sess-1").await, Some(id));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get_session_binding(1, "sess-1").await, None);
    }
}
