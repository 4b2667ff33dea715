//! CC (request-rate) limiting service
//!
//! Sliding-window counting per URI: the shared KV holds the list of request
//! timestamps inside the window under `cc_limit:{uri}`, with the entry TTL
//! equal to the window so idle URIs clean themselves up.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{WafError, WafResult};
use crate::model::{CcRule, CcRuleQuery, RuleStatus};
use crate::storage::{CcRuleStore, KvStore};

fn window_key(uri: &str) -> String {
    format!("cc_limit:{uri}")
}

pub struct CcService {
    store: Arc<dyn CcRuleStore>,
    kv: Arc<dyn KvStore>,
}

impl CcService {
    pub fn new(store: Arc<dyn CcRuleStore>, kv: Arc<dyn KvStore>) -> Self {
        Self { store, kv }
    }

    pub async fn create_cc_rule(&self, rule: CcRule) -> WafResult<CcRule> {
        rule.validate()?;
        self.store.create_cc_rule(rule).await
    }

    pub async fn update_cc_rule(&self, rule: CcRule) -> WafResult<CcRule> {
        rule.validate()?;
        let updated = self.store.update_cc_rule(rule).await?;
        // The old window no longer reflects the rule's limits.
        if let Err(err) = self.kv.del(&window_key(&updated.uri)).await {
            warn!(uri = %updated.uri, error = %err, "failed to reset cc window");
        }
        Ok(updated)
    }

    pub async fn delete_cc_rule(&self, id: i64) -> WafResult<()> {
        let rule = self.store.get_cc_rule(id).await?;
        self.store.delete_cc_rule(id).await?;
        if let Some(rule) = rule {
            if let Err(err) = self.kv.del(&window_key(&rule.uri)).await {
                warn!(uri = %rule.uri, error = %err, "failed to reset cc window");
            }
        }
        Ok(())
    }

    pub async fn get_cc_rule(&self, id: i64) -> WafResult<Option<CcRule>> {
        self.store.get_cc_rule(id).await
    }

    pub async fn list_cc_rules(&self, query: &CcRuleQuery) -> WafResult<Vec<CcRule>> {
        let rules = self.store.list_cc_rules().await?;
        Ok(rules
            .into_iter()
            .filter(|r| query.uri.as_deref().map_or(true, |u| r.uri == u))
            .filter(|r| query.status.map_or(true, |s| r.status == s))
            .filter(|r| query.limit_unit.map_or(true, |u| r.limit_unit == u))
            .collect())
    }

    /// Whether a request to `uri` is over its CC limit. Returns false when no
    /// enabled rule matches the URI exactly.
    pub async fn check_cc_limit(&self, cancel: &CancelToken, uri: &str) -> WafResult<bool> {
        let rules = self.store.list_cc_rules().await?;
        for rule in rules {
            if rule.status == RuleStatus::Enabled && rule.uri == uri {
                return self.check_limit(cancel, &rule).await;
            }
        }
        Ok(false)
    }

    /// Sliding-window check: filter recorded timestamps to the window, limit
    /// if the count reaches the rate, otherwise record this request.
    async fn check_limit(&self, cancel: &CancelToken, rule: &CcRule) -> WafResult<bool> {
        let key = window_key(&rule.uri);
        let window = rule.window();
        let window_ms = window.as_millis() as i64;
        let now_ms = Utc::now().timestamp_millis();

        cancel.ensure_active()?;
        let timestamps: Vec<i64> = match self.kv.get(&key).await? {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(key = %key, error = %e, "corrupt cc window entry, resetting");
                Vec::new()
            }),
            None => Vec::new(),
        };

        let mut valid: Vec<i64> = timestamps
            .into_iter()
            .filter(|&ts| ts > now_ms - window_ms && ts < now_ms + window_ms)
            .collect();

        if valid.len() >= rule.limit_rate as usize {
            warn!(
                uri = %rule.uri,
                current = valid.len(),
                limit = rule.limit_rate,
                "cc limit triggered"
            );
            return Ok(true);
        }

        valid.push(now_ms);
        let bytes = serde_json::to_vec(&valid)
            .map_err(|e| WafError::cache(format!("failed to encode cc window: {e}")))?;
        self.kv.set(&key, bytes, Some(window)).await?;

        debug!(uri = %rule.uri, count = valid.len(), "cc window updated");
        Ok(false)
    }

    /// Reset the sliding windows of every configured URI. Called on rule
    /// reload so stale windows do not outlive their rules.
    pub async fn reload(&self, cancel: &CancelToken) -> WafResult<()> {
        cancel.ensure_active()?;
        let rules = self.store.list_cc_rules().await?;
        for rule in rules {
            if let Err(err) = self.kv.del(&window_key(&rule.uri)).await {
                warn!(uri = %rule.uri, error = %err, "failed to delete cc window");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LimitUnit;
    use crate::storage::memory::{MemoryKv, MemoryStore};

    fn service() -> (CcService, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        let store = Arc::new(MemoryStore::new());
        (CcService::new(store, kv.clone()), kv)
    }

    fn rule(uri: &str, limit_rate: u32) -> CcRule {
        CcRule {
            id: 0,
            uri: uri.to_string(),
            limit_rate,
            time_window: 1,
            limit_unit: LimitUnit::Minute,
            status: RuleStatus::Enabled,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_limit_enforced_within_window() {
        let (svc, _) = service();
        svc.create_cc_rule(rule("/api", 3)).await.unwrap();

        let cancel = CancelToken::new();
        for _ in 0..3 {
            assert!(!svc.check_cc_limit(&cancel, "/api").await.unwrap());
        }
        assert!(svc.check_cc_limit(&cancel, "/api").await.unwrap());
        assert!(svc.check_cc_limit(&cancel, "/api").await.unwrap());
    }

    #[tokio::test]
    async fn test_unconfigured_uri_is_never_limited() {
        let (svc, _) = service();
        svc.create_cc_rule(rule("/api", 1)).await.unwrap();

        let cancel = CancelToken::new();
        for _ in 0..5 {
            assert!(!svc.check_cc_limit(&cancel, "/other").await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_disabled_rule_does_not_fire() {
        let (svc, _) = service();
        let mut r = rule("/api", 1);
        r.status = RuleStatus::Disabled;
        svc.create_cc_rule(r).await.unwrap();

        let cancel = CancelToken::new();
        for _ in 0..3 {
            assert!(!svc.check_cc_limit(&cancel, "/api").await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_reload_resets_windows() {
        let (svc, kv) = service();
        svc.create_cc_rule(rule("/api", 1)).await.unwrap();

        let cancel = CancelToken::new();
        assert!(!svc.check_cc_limit(&cancel, "/api").await.unwrap());
        assert!(svc.check_cc_limit(&cancel, "/api").await.unwrap());

        svc.reload(&cancel).await.unwrap();
        assert!(kv.get("cc_limit:/api").await.unwrap().is_none());
        assert!(!svc.check_cc_limit(&cancel, "/api").await.unwrap());
    }

    #[tokio::test]
    async fn test_cancellation_aborts_before_kv() {
        let (svc, _) = service();
        svc.create_cc_rule(rule("/api", 3)).await.unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(svc.check_cc_limit(&cancel, "/api").await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_window_resets_cleanly() {
        let (svc, kv) = service();
        svc.create_cc_rule(rule("/api", 2)).await.unwrap();
        kv.set("cc_limit:/api", b"garbage".to_vec(), None).await.unwrap();

        let cancel = CancelToken::new();
        assert!(!svc.check_cc_limit(&cancel, "/api").await.unwrap());
    }
}
