//! IP list service
//!
//! IP rules are policy, not pattern: the service answers `is_blocked` and
//! `is_whitelisted` for a client address. Blocked requires an active
//! black-list rule (permanent, or temporary and unexpired); whitelisted only
//! requires a white-list rule to exist. Verdicts are cached with a short TTL
//! so expiring temporary rules converge quickly.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::WafResult;
use crate::model::{IpListType, IpRule, IpRuleQuery};
use crate::storage::{IpRuleStore, KvStore};

const RULE_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

fn rule_key(id: i64) -> String {
    format!("ip_rule:{id}")
}

fn blocked_key(ip: &str) -> String {
    format!("ip_blocked:{ip}")
}

fn whitelisted_key(ip: &str) -> String {
    format!("ip_whitelisted:{ip}")
}

pub struct IpService {
    store: Arc<dyn IpRuleStore>,
    kv: Arc<dyn KvStore>,
    verdict_ttl: Duration,
}

impl IpService {
    pub fn new(store: Arc<dyn IpRuleStore>, kv: Arc<dyn KvStore>, verdict_ttl: Duration) -> Self {
        Self {
            store,
            kv,
            verdict_ttl,
        }
    }

    pub async fn create_ip_rule(&self, rule: IpRule) -> WafResult<IpRule> {
        rule.validate()?;
        if self.store.exists_by_ip(&rule.ip).await? {
            return Err(crate::error::WafError::rule_conflict(format!(
                "a rule already exists for {}",
                rule.ip
            )));
        }
        let stored = self.store.create_ip_rule(rule).await?;
        self.refresh_caches(&stored).await;
        Ok(stored)
    }

    pub async fn update_ip_rule(&self, rule: IpRule) -> WafResult<IpRule> {
        rule.validate()?;
        let Some(old) = self.store.get_ip_rule(rule.id).await? else {
            return Err(crate::error::WafError::rule_not_found(format!(
                "ip rule not found: {}",
                rule.id
            )));
        };
        let stored = self.store.update_ip_rule(rule).await?;
        self.drop_verdicts(&old.ip).await;
        self.refresh_caches(&stored).await;
        Ok(stored)
    }

    pub async fn delete_ip_rule(&self, id: i64) -> WafResult<()> {
        let old = self.store.get_ip_rule(id).await?;
        self.store.delete_ip_rule(id).await?;

        if let Err(err) = self.kv.del(&rule_key(id)).await {
            warn!(rule_id = id, error = %err, "failed to drop ip rule cache");
        }
        if let Some(old) = old {
            self.drop_verdicts(&old.ip).await;
        }
        Ok(())
    }

    pub async fn get_ip_rule(&self, id: i64) -> WafResult<Option<IpRule>> {
        match self.kv.get(&rule_key(id)).await {
            Ok(Some(bytes)) => {
                if let Ok(rule) = serde_json::from_slice::<IpRule>(&bytes) {
                    return Ok(Some(rule));
                }
                warn!(rule_id = id, "corrupt ip rule cache entry, refetching");
            }
            Ok(None) => {}
            Err(err) => warn!(rule_id = id, error = %err, "ip rule cache read failed"),
        }

        let rule = self.store.get_ip_rule(id).await?;
        if let Some(rule) = &rule {
            self.refresh_caches(rule).await;
        }
        Ok(rule)
    }

    pub async fn list_ip_rules(&self, query: &IpRuleQuery) -> WafResult<Vec<IpRule>> {
        self.store.list_ip_rules(query).await
    }

    /// True iff an active black-list rule covers the address.
    pub async fn is_blocked(&self, cancel: &CancelToken, ip: &str) -> WafResult<bool> {
        cancel.ensure_active()?;
        if let Some(cached) = self.cached_verdict(&blocked_key(ip)).await {
            return Ok(cached);
        }

        let rule = self.store.get_ip_rule_covering(ip).await?;
        let blocked = rule
            .map(|r| r.ip_type == IpListType::Black && r.is_active(Utc::now()))
            .unwrap_or(false);

        self.store_verdict(&blocked_key(ip), blocked).await;
        Ok(blocked)
    }

    /// True iff a white-list rule covers the address.
    pub async fn is_whitelisted(&self, cancel: &CancelToken, ip: &str) -> WafResult<bool> {
        cancel.ensure_active()?;
        if let Some(cached) = self.cached_verdict(&whitelisted_key(ip)).await {
            return Ok(cached);
        }

        let rule = self.store.get_ip_rule_covering(ip).await?;
        let whitelisted = rule.map(|r| r.ip_type == IpListType::White).unwrap_or(false);

        self.store_verdict(&whitelisted_key(ip), whitelisted).await;
        Ok(whitelisted)
    }

    /// Whether any rule covers the address at all.
    pub async fn check_ip(&self, ip: &str) -> WafResult<bool> {
        Ok(self.store.get_ip_rule_covering(ip).await?.is_some())
    }

    async fn cached_verdict(&self, key: &str) -> Option<bool> {
        match self.kv.get(key).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).ok(),
            Ok(None) => None,
            Err(err) => {
                warn!(key = %key, error = %err, "verdict cache read failed");
                None
            }
        }
    }

    async fn store_verdict(&self, key: &str, verdict: bool) {
        let bytes = if verdict { b"true".to_vec() } else { b"false".to_vec() };
        if let Err(err) = self.kv.set(key, bytes, Some(self.verdict_ttl)).await {
            warn!(key = %key, error = %err, "verdict cache write failed");
        }
    }

    async fn refresh_caches(&self, rule: &IpRule) {
        match serde_json::to_vec(rule) {
            Ok(bytes) => {
                if let Err(err) = self
                    .kv
                    .set(&rule_key(rule.id), bytes, Some(RULE_CACHE_TTL))
                    .await
                {
                    warn!(rule_id = rule.id, error = %err, "ip rule cache write failed");
                }
            }
            Err(err) => warn!(rule_id = rule.id, error = %err, "ip rule encode failed"),
        }
        self.drop_verdicts(&rule.ip).await;
    }

    async fn drop_verdicts(&self, ip: &str) {
        for key in [blocked_key(ip), whitelisted_key(ip)] {
            if let Err(err) = self.kv.del(&key).await {
                warn!(key = %key, error = %err, "verdict cache invalidation failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockType;
    use crate::storage::memory::{MemoryKv, MemoryStore};
    use chrono::Duration as ChronoDuration;

    fn service() -> IpService {
        IpService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryKv::new()),
            Duration::from_secs(60),
        )
    }

    fn rule(ip: &str, ip_type: IpListType) -> IpRule {
        IpRule {
            id: 0,
            ip: ip.to_string(),
            ip_type,
            block_type: BlockType::Permanent,
            expire_time: None,
            description: String::new(),
            created_by: 0,
            updated_by: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_black_rule_blocks() {
        let svc = service();
        svc.create_ip_rule(rule("6.6.6.6", IpListType::Black)).await.unwrap();

        let cancel = CancelToken::new();
        assert!(svc.is_blocked(&cancel, "6.6.6.6").await.unwrap());
        assert!(!svc.is_whitelisted(&cancel, "6.6.6.6").await.unwrap());
        assert!(!svc.is_blocked(&cancel, "7.7.7.7").await.unwrap());
    }

    #[tokio::test]
    async fn test_white_rule_whitelists_without_blocking() {
        let svc = service();
        svc.create_ip_rule(rule("9.9.9.9", IpListType::White)).await.unwrap();

        let cancel = CancelToken::new();
        assert!(svc.is_whitelisted(&cancel, "9.9.9.9").await.unwrap());
        assert!(!svc.is_blocked(&cancel, "9.9.9.9").await.unwrap());
    }

    #[tokio::test]
    async fn test_cidr_rule_blocks_range() {
        let svc = service();
        svc.create_ip_rule(rule("10.0.0.0/8", IpListType::Black)).await.unwrap();

        let cancel = CancelToken::new();
        assert!(svc.is_blocked(&cancel, "10.42.0.1").await.unwrap());
        assert!(!svc.is_blocked(&cancel, "11.0.0.1").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_temporary_rule_is_inactive() {
        let store = Arc::new(MemoryStore::new());
        let svc = IpService::new(
            store.clone(),
            Arc::new(MemoryKv::new()),
            Duration::from_secs(60),
        );
        let mut r = rule("8.8.4.4", IpListType::Black);
        r.block_type = BlockType::Temporary;
        r.expire_time = Some(Utc::now() + ChronoDuration::milliseconds(40));
        svc.create_ip_rule(r).await.unwrap();

        let cancel = CancelToken::new();
        assert!(svc.is_blocked(&cancel, "8.8.4.4").await.unwrap());

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        // Same store, fresh verdict cache, so expiry is not masked by the
        // cached verdict. In production the short TTL bounds this staleness.
        let svc2 = IpService::new(store, Arc::new(MemoryKv::new()), Duration::from_secs(60));
        assert!(!svc2.is_blocked(&cancel, "8.8.4.4").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_ip_conflicts() {
        let svc = service();
        svc.create_ip_rule(rule("1.1.1.1", IpListType::Black)).await.unwrap();

        let err = svc
            .create_ip_rule(rule("1.1.1.1", IpListType::White))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::RuleConflict);
    }

    #[tokio::test]
    async fn test_invalid_address_rejected() {
        let svc = service();
        let err = svc
            .create_ip_rule(rule("999.1.2.3", IpListType::Black))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_delete_drops_verdict_cache() {
        let svc = service();
        let stored = svc.create_ip_rule(rule("2.2.2.2", IpListType::Black)).await.unwrap();

        let cancel = CancelToken::new();
        assert!(svc.is_blocked(&cancel, "2.2.2.2").await.unwrap());

        svc.delete_ip_rule(stored.id).await.unwrap();
        assert!(!svc.is_blocked(&cancel, "2.2.2.2").await.unwrap());
    }

    #[tokio::test]
    async fn test_check_ip_reports_any_rule() {
        let svc = service();
        svc.create_ip_rule(rule("3.3.3.3", IpListType::White)).await.unwrap();

        assert!(svc.check_ip("3.3.3.3").await.unwrap());
        assert!(!svc.check_ip("4.4.4.4").await.unwrap());
    }
}
