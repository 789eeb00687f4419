use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::{Account, Platform};

use super::AccountRepository;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AccountStoreFile {
    accounts: Vec<Account>,
}

/// JSON-file backed `AccountRepository`, following
/// `ai_providers::AIProviderStore`'s load-on-construct /
/// persist-whole-file-on-write discipline.
pub struct JsonAccountStore {
    path: PathBuf,
    accounts: Arc<RwLock<HashMap<Uuid, Account>>>,
}

impl JsonAccountStore {
    pub async fn new(path: PathBuf) -> Self {
        let loaded = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<AccountStoreFile>(&content) {
                Ok(file) => file,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to parse account store file");
                    AccountStoreFile::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => AccountStoreFile::default(),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to read account store file");
                AccountStoreFile::default()
            }
        };

        let mut map = HashMap::new();
        for account in loaded.accounts {
            map.insert(account.id, account);
        }

        Self {
            path,
            accounts: Arc::new(RwLock::new(map)),
        }
    }

    async fn persist(&self) {
        let snapshot = {
            let guard = self.accounts.read().await;
            let mut accounts: Vec<Account> = guard.values().cloned().collect();
            accounts.sort_by_key(|a| a.id);
            AccountStoreFile { accounts }
        };

        if let Some(parent) = self.path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to create account store directory");
                return;
            }
        }

        match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => {
                let tmp = self.path.with_extension("json.tmp");
                if let Err(err) = tokio::fs::write(&tmp, &bytes).await {
                    tracing::warn!(path = %tmp.display(), error = %err, "failed to write account store temp file");
                    return;
                }
                if let Err(err) = tokio::fs::rename(&tmp, &self.path).await {
                    tracing::warn!(path = %self.path.display(), error = %err, "failed to rename account store temp file");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize account store");
            }
        }
    }
}

#[async_trait]
impl AccountRepository for JsonAccountStore {
    async fn get(&self, id: Uuid) -> Option<Account> {
        self.accounts.read().await.get(&id).cloned()
    }

    async fn list_by_platform_group_schedulable(
        &self,
        platform: Platform,
        group_id: i64,
        mixed_antigravity: bool,
    ) -> Vec<Account> {
        let guard = self.accounts.read().await;
        guard
            .values()
            .filter(|a| a.schedulable && a.group_ids.contains(&group_id))
            .filter(|a| {
                a.platform == platform
                    || (mixed_antigravity && a.platform == Platform::Antigravity && a.mixed_scheduling_enabled)
            })
            .cloned()
            .collect()
    }

    async fn upsert(&self, account: Account) {
        {
            let mut guard = self.accounts.write().await;
            guard.insert(account.id, account);
        }
        self.persist().await;
    }

    async fn set_last_used_bulk(&self, stamps: &HashMap<Uuid, DateTime<Utc>>) {
        {
            let mut guard = self.accounts.write().await;
            for (id, at) in stamps {
                if let Some(account) = guard.get_mut(id) {
                    account.last_used_at = Some(*at);
                }
            }
        }
        self.persist().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccountStatus, AccountType, Credentials};
    use std::collections::HashSet;

    fn sample_account(id: Uuid, group_id: i64) -> Account {
        let now = Utc::now();
        Account {
            id,
            name: "test".to_string(),
            platform: Platform::Anthropic,
            account_type: AccountType::ApiKey,
            credentials: Credentials::default(),
            status: AccountStatus::Active,
            schedulable: true,
            priority: 0,
            concurrency: 4,
            last_used_at: None,
            rate_limit_reset_at: None,
            overloaded_until: None,
            temp_unschedulable_until: None,
            temp_unschedulable_reason: None,
            session_window: None,
            group_ids: HashSet::from([group_id]),
            mixed_scheduling_enabled: false,
            custom_error_codes: None,
            model_rate_limits: HashMap::new(),
            temp_unschedulable_rules: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn persists_and_reloads_accounts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("accounts.json");
        let store = JsonAccountStore::new(path.clone()).await;

        let id = Uuid::new_v4();
        store.upsert(sample_account(id, 1)).await;

        let reloaded = JsonAccountStore::new(path).await;
        let fetched = reloaded.get(id).await.expect("account present after reload");
        assert_eq!(fetched.id, id);
    }

    #[tokio::test]
    async fn filters_by_platform_group_and_schedulable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonAccountStore::new(temp.path().join("accounts.json")).await;

        let a = sample_account(Uuid::new_v4(), 1);
        let mut b = sample_account(Uuid::new_v4(), 1);
        b.schedulable = false;
        store.upsert(a.clone()).await;
        store.upsert(b).await;

        let found = store
            .list_by_platform_group_schedulable(Platform::Anthropic, 1, false)
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, a.id);
    }
}
