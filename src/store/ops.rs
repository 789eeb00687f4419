use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::{RetryAttempt, RetryAttemptStatus, SourceError};

use super::OpsRepository;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OpsStoreFile {
    source_errors: Vec<SourceError>,
    retry_attempts: Vec<RetryAttempt>,
}

pub struct JsonOpsStore {
    path: PathBuf,
    source_errors: Arc<RwLock<HashMap<Uuid, SourceError>>>,
    retry_attempts: Arc<RwLock<HashMap<Uuid, RetryAttempt>>>,
}

impl JsonOpsStore {
    pub async fn new(path: PathBuf) -> Self {
        let loaded = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str::<OpsStoreFile>(&content).unwrap_or_default(),
            Err(_) => OpsStoreFile::default(),
        };
        let mut errors = HashMap::new();
        for e in loaded.source_errors {
            errors.insert(e.id, e);
        }
        let mut attempts = HashMap::new();
        for a in loaded.retry_attempts {
            attempts.insert(a.id, a);
        }
        Self {
            path,
            source_errors: Arc::new(RwLock::new(errors)),
            retry_attempts: Arc::new(RwLock::new(attempts)),
        }
    }

    async fn persist(&self) {
        let snapshot = {
            let errors = self.source_errors.read().await;
            let attempts = self.retry_attempts.read().await;
            OpsStoreFile {
                source_errors: errors.values().cloned().collect(),
                retry_attempts: attempts.values().cloned().collect(),
            }
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
impl OpsRepository for JsonOpsStore {
    async fn record_source_error(&self, error: SourceError) {
        {
            let mut guard = self.source_errors.write().await;
            guard.insert(error.id, error);
        }
        self.persist().await;
    }

    async fn get_source_error(&self, id: Uuid) -> Option<SourceError> {
        self.source_errors.read().await.get(&id).cloned()
    }

    async fn mark_resolved(&self, id: Uuid) {
        {
            let mut guard = self.source_errors.write().await;
            if let Some(e) = guard.get_mut(&id) {
                e.resolved = true;
            }
        }
        self.persist().await;
    }

    async fn insert_retry_attempt(&self, attempt: RetryAttempt) {
        {
            let mut guard = self.retry_attempts.write().await;
            guard.insert(attempt.id, attempt);
        }
        self.persist().await;
    }

    async fn update_retry_attempt(&self, attempt: RetryAttempt) {
        self.insert_retry_attempt(attempt).await;
    }

    async fn has_running_attempt(&self, source_error_id: Uuid) -> bool {
        self.retry_attempts
            .read()
            .await
            .values()
            .any(|a| a.source_error_id == source_error_id && a.status == RetryAttemptStatus::Running)
    }

    async fn last_attempt_started_at(&self, source_error_id: Uuid) -> Option<DateTime<Utc>> {
        self.retry_attempts
            .read()
            .await
            .values()
            .filter(|a| a.source_error_id == source_error_id)
            .map(|a| a.started_at)
            .max()
    }
}
