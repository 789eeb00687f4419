use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::model::OutboxEvent;

use super::SchedulerOutboxRepository;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OutboxStoreFile {
    events: Vec<OutboxEvent>,
}

/// Append-only event log. Real deployments back `SchedulerOutboxRepository`
/// with the same table the account writers mutate inside; this JSON-file
/// stand-in appends in memory and flushes the whole log on every append,
/// which is fine for the modest event volumes of a reference instance.
pub struct JsonOutboxStore {
    path: PathBuf,
    events: Arc<RwLock<Vec<OutboxEvent>>>,
    next_id: AtomicI64,
}

impl JsonOutboxStore {
    pub async fn new(path: PathBuf) -> Self {
        let loaded = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str::<OutboxStoreFile>(&content).unwrap_or_default(),
            Err(_) => OutboxStoreFile::default(),
        };
        let next_id = loaded.events.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        Self {
            path,
            events: Arc::new(RwLock::new(loaded.events)),
            next_id: AtomicI64::new(next_id),
        }
    }

    async fn persist(&self) {
        let snapshot = {
            let guard = self.events.read().await;
            OutboxStoreFile { events: guard.clone() }
        };
        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Ok(bytes) = serde_json::to_vec_pretty(&snapshot) {
            let tmp = self.path.with_extension("json.tmp");
            if tokio::fs::write(&tmp, &bytes).await.is_ok() {
                let _ = tokio::fs::rename(&tmp, &self.path).await;
            }
        }
    }
}

#[async_trait]
impl SchedulerOutboxRepository for JsonOutboxStore {
    async fn append(&self, mut event: OutboxEvent) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        event.id = id;
        {
            let mut guard = self.events.write().await;
            guard.push(event);
        }
        self.persist().await;
        id
    }

    async fn read_after(&self, watermark: i64, limit: usize) -> Vec<OutboxEvent> {
        let guard = self.events.read().await;
        let mut matching: Vec<OutboxEvent> = guard.iter().filter(|e| e.id > watermark).cloned().collect();
        matching.sort_by_key(|e| e.id);
        matching.truncate(limit);
        matching
    }

    async fn max_id(&self) -> i64 {
        self.events.read().await.iter().map(|e| e.id).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OutboxEventType;
    use chrono::Utc;

    fn event(event_type: OutboxEventType) -> OutboxEvent {
        OutboxEvent {
            id: 0,
            event_type,
            account_id: None,
            group_id: None,
            payload: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn reads_in_id_order_above_watermark() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonOutboxStore::new(temp.path().join("outbox.json")).await;

        store.append(event(OutboxEventType::AccountLastUsed)).await;
        store.append(event(OutboxEventType::GroupChanged)).await;
        store.append(event(OutboxEventType::FullRebuild)).await;

        let page = store.read_after(1, 200).await;
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, 2);
        assert_eq!(page[1].id, 3);
    }

    #[tokio::test]
    async fn respects_read_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonOutboxStore::new(temp.path().join("outbox.json")).await;
        for _ in 0..5 {
            store.append(event(OutboxEventType::AccountLastUsed)).await;
        }
        let page = store.read_after(0, 2).await;
        assert_eq!(page.len(), 2);
    }
}
