//! Repository and distributed-cache traits, plus the default JSON-file /
//! in-process implementations that satisfy them. See SPEC_FULL.md §1
//! "AMBIENT STACK — runtime shape" and §3 "SUPPLEMENTAL — repository
//! traits".
//!
//! The spec treats the persistent store and the distributed cache as
//! external collaborators referenced only through interfaces. These
//! traits are that interface; `JsonFileStore`-family structs are a
//! single-instance reference implementation grounded in
//! `ai_providers::AIProviderStore` / `provider_health::ModelChainStore`'s
//! constructor-loads-from-disk, atomic-write-temp-then-rename pattern.

mod accounts;
mod cache;
mod groups;
mod ops;
mod outbox;

pub use accounts::JsonAccountStore;
pub use cache::InProcessDistributedCache;
pub use groups::JsonGroupStore;
pub use ops::JsonOpsStore;
pub use outbox::JsonOutboxStore;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{
    Account, AccountProjection, BucketKey, Group, OutboxEvent, Platform, RetryAttempt,
    SchedulerMode, SnapshotEntry, SourceError,
};

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Option<Account>;
    async fn list_by_platform_group_schedulable(
        &self,
        platform: Platform,
        group_id: i64,
        mixed_antigravity: bool,
    ) -> Vec<Account>;
    async fn upsert(&self, account: Account);
    async fn set_last_used_bulk(&self, stamps: &std::collections::HashMap<Uuid, DateTime<Utc>>);
}

#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn get(&self, id: i64) -> Option<Group>;
    async fn list(&self) -> Vec<Group>;
    async fn upsert(&self, group: Group) -> Result<(), String>;
    async fn delete(&self, id: i64) -> Result<(), String>;
}

#[async_trait]
pub trait SchedulerOutboxRepository: Send + Sync {
    async fn append(&self, event: OutboxEvent) -> i64;
    async fn read_after(&self, watermark: i64, limit: usize) -> Vec<OutboxEvent>;
    async fn max_id(&self) -> i64;
}

#[async_trait]
pub trait OpsRepository: Send + Sync {
    async fn record_source_error(&self, error: SourceError);
    async fn get_source_error(&self, id: Uuid) -> Option<SourceError>;
    async fn mark_resolved(&self, id: Uuid);
    async fn insert_retry_attempt(&self, attempt: RetryAttempt);
    async fn update_retry_attempt(&self, attempt: RetryAttempt);
    async fn has_running_attempt(&self, source_error_id: Uuid) -> bool;
    async fn last_attempt_started_at(&self, source_error_id: Uuid) -> Option<DateTime<Utc>>;
}

/// Redis-shaped distributed-cache collaborator: snapshots, per-account
/// projections, the outbox watermark, rebuild locks, session bindings,
/// concurrency slots, and the rule cache + its pub/sub channel.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get_watermark(&self) -> i64;
    async fn advance_watermark(&self, to: i64);

    /// Probe-and-skip; `true` means the lock was acquired.
    async fn try_acquire_rebuild_lock(&self, bucket: &str, ttl: std::time::Duration) -> bool;
    async fn release_rebuild_lock(&self, bucket: &str);

    async fn get_session_binding(&self, group_id: i64, session_hash: &str) -> Option<Uuid>;
    async fn put_session_binding(&self, group_id: i64, session_hash: &str, account_id: Uuid, ttl: std::time::Duration);
    async fn delete_session_binding(&self, group_id: i64, session_hash: &str);

    /// Reciprocal with `release_slot`; must always pair, even on
    /// panic/error in the caller.
    async fn acquire_slot(&self, account_id: Uuid, max_concurrency: u32) -> bool;
    async fn release_slot(&self, account_id: Uuid);
    async fn in_flight(&self, account_id: Uuid) -> u32;

    async fn get_bucket_snapshot(&self, key: BucketKey) -> Option<SnapshotEntry>;
    async fn put_bucket_snapshot(&self, key: BucketKey, entry: SnapshotEntry);
    async fn known_bucket_keys(&self) -> Vec<BucketKey>;

    /// Sticky-session lookup without a bucket scan.
    async fn get_account_projection(&self, id: Uuid) -> Option<AccountProjection>;
    async fn put_account_projection(&self, projection: AccountProjection);
    async fn delete_account_projection(&self, id: Uuid);

    async fn excluded_once(&self, _ids: &HashSet<Uuid>) {}
}

pub const fn default_mode_for(_platform: Platform) -> SchedulerMode {
    SchedulerMode::Single
}
