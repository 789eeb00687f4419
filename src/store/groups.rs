use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::model::Group;

use super::GroupRepository;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GroupStoreFile {
    groups: Vec<Group>,
}

pub struct JsonGroupStore {
    path: PathBuf,
    groups: Arc<RwLock<HashMap<i64, Group>>>,
}

impl JsonGroupStore {
    pub async fn new(path: PathBuf) -> Self {
        let loaded = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str::<GroupStoreFile>(&content).unwrap_or_default(),
            Err(_) => GroupStoreFile::default(),
        };
        let mut map = HashMap::new();
        for group in loaded.groups {
            map.insert(group.id, group);
        }
        Self {
            path,
            groups: Arc::new(RwLock::new(map)),
        }
    }

    async fn persist(&self) {
        let snapshot = {
            let guard = self.groups.read().await;
            let mut groups: Vec<Group> = guard.values().cloned().collect();
            groups.sort_by_key(|g| g.id);
            GroupStoreFile { groups }
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

    /// Walk the `fallback_group_id_on_invalid_request` chain from
    /// `start`, bounded by a seen-set; `Err` on cycle. See SPEC_FULL.md §9
    /// "Cyclic fallback groups".
    async fn detect_cycle(&self, start: i64) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        let mut current = start;
        let guard = self.groups.read().await;
        loop {
            if !seen.insert(current) {
                return Err("fallback group cycle".to_string());
            }
            match guard.get(&current).and_then(|g| g.fallback_group_id_on_invalid_request) {
                Some(next) => current = next,
                None => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl GroupRepository for JsonGroupStore {
    async fn get(&self, id: i64) -> Option<Group> {
        self.groups.read().await.get(&id).cloned()
    }

    async fn list(&self) -> Vec<Group> {
        self.groups.read().await.values().cloned().collect()
    }

    async fn upsert(&self, group: Group) -> Result<(), String> {
        if let Some(fallback_id) = group.fallback_group_id_on_invalid_request {
            if !group.may_set_fallback() {
                return Err("only anthropic/antigravity groups may set a fallback".to_string());
            }
            // The target may not exist yet (groups can be upserted in any
            // order); existence-dependent checks only apply once it does.
            let target = self.groups.read().await.get(&fallback_id).cloned();
            match target {
                Some(target) if !target.is_valid_fallback_target() => {
                    return Err("fallback group must be a non-subscription anthropic group".to_string());
                }
                Some(target) if target.fallback_group_id_on_invalid_request.is_some() => {
                    return Err("nested fallback groups are rejected".to_string());
                }
                _ => {}
            }
            self.detect_cycle(fallback_id).await?;
        }

        {
            let mut guard = self.groups.write().await;
            guard.insert(group.id, group);
        }
        self.persist().await;
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), String> {
        {
            let mut guard = self.groups.write().await;
            guard.remove(&id);
        }
        self.persist().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SubscriptionType, UsageLimits};
    use crate::model::Platform;

    fn group(id: i64, platform: Platform, sub: SubscriptionType, fallback: Option<i64>) -> Group {
        Group {
            id,
            name: format!("group-{id}"),
            platform,
            subscription_type: sub,
            image_tier_prices: HashMap::new(),
            fallback_group_id_on_invalid_request: fallback,
            usage_limits: UsageLimits::default(),
        }
    }

    #[tokio::test]
    async fn rejects_fallback_cycle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonGroupStore::new(temp.path().join("groups.json")).await;

        let g1 = group(1, Platform::Anthropic, SubscriptionType::Subscription, Some(2));
        let g2 = group(2, Platform::Anthropic, SubscriptionType::PayAsYouGo, Some(1));

        store.upsert(g2).await.expect("g2 inserts fine standalone");
        let result = store.upsert(g1).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn rejects_nested_fallback() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonGroupStore::new(temp.path().join("groups.json")).await;

        let leaf = group(2, Platform::Anthropic, SubscriptionType::PayAsYouGo, Some(3));
        let root_target = group(3, Platform::Anthropic, SubscriptionType::PayAsYouGo, None);
        store.upsert(root_target).await.unwrap();
        store.upsert(leaf).await.unwrap();

        let g1 = group(1, Platform::Anthropic, SubscriptionType::Subscription, Some(2));
        let result = store.upsert(g1).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn rejects_fallback_from_non_anthropic_platform() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonGroupStore::new(temp.path().join("groups.json")).await;

        let target = group(2, Platform::Anthropic, SubscriptionType::PayAsYouGo, None);
        store.upsert(target).await.unwrap();

        let g1 = group(1, Platform::Openai, SubscriptionType::Subscription, Some(2));
        let result = store.upsert(g1).await;
        assert!(result.is_err());
    }
}
