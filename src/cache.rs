//! Two-tier rule cache
//!
//! A short-TTL in-process tier (`moka`) in front of the shared KV store.
//! Lookup order is process, then shared (backfilling the process tier), then
//! the caller's authoritative store. Writes invalidate both tiers; the cache
//! is never the source of truth.

use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{WafError, WafResult};
use crate::model::Rule;
use crate::storage::KvStore;

const LOCAL_MAX_CAPACITY: u64 = 100_000;

/// Generic two-tier byte cache. Shared-tier keys are namespaced with the
/// configured prefix.
pub struct TwoTierCache {
    local: Cache<String, Vec<u8>>,
    shared: Arc<dyn KvStore>,
    prefix: String,
    local_ttl: Duration,
}

impl TwoTierCache {
    pub fn new(shared: Arc<dyn KvStore>, prefix: &str, local_ttl: Duration) -> Self {
        Self {
            local: Cache::builder()
                .max_capacity(LOCAL_MAX_CAPACITY)
                .time_to_live(local_ttl)
                .build(),
            shared,
            prefix: prefix.to_string(),
            local_ttl,
        }
    }

    fn shared_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    pub async fn get(&self, key: &str) -> WafResult<Option<Vec<u8>>> {
        if let Some(value) = self.local.get(key) {
            return Ok(Some(value));
        }

        let Some(value) = self.shared.get(&self.shared_key(key)).await? else {
            return Ok(None);
        };

        // Shared hit backfills the process tier.
        self.local.insert(key.to_string(), value.clone());
        Ok(Some(value))
    }

    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> WafResult<()> {
        self.local.insert(key.to_string(), value.clone());
        self.shared.set(&self.shared_key(key), value, Some(ttl)).await
    }

    pub async fn delete(&self, key: &str) -> WafResult<()> {
        self.local.invalidate(key);
        self.shared.del(&self.shared_key(key)).await
    }

    /// Drop every entry under this cache's namespace from both tiers.
    pub async fn clear(&self) -> WafResult<()> {
        self.local.invalidate_all();
        let keys = self.shared.scan(&format!("{}:", self.prefix)).await?;
        for key in keys {
            self.shared.del(&key).await?;
        }
        Ok(())
    }

    pub fn local_ttl(&self) -> Duration {
        self.local_ttl
    }
}

/// Typed rule cache on top of [`TwoTierCache`]. A cache miss is an internal
/// signal: callers see `Ok(None)` and fall back to the store.
pub struct RuleCache {
    tiers: TwoTierCache,
    rule_ttl: Duration,
}

const RULE_SET_KEY: &str = "rules:all";

impl RuleCache {
    pub fn new(shared: Arc<dyn KvStore>, local_ttl: Duration, rule_ttl: Duration) -> Self {
        Self {
            tiers: TwoTierCache::new(shared, "waf", local_ttl),
            rule_ttl,
        }
    }

    fn rule_key(id: i64) -> String {
        format!("rule:{id}")
    }

    pub async fn get_rule(&self, id: i64) -> WafResult<Option<Rule>> {
        match self.tiers.get(&Self::rule_key(id)).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn set_rule(&self, rule: &Rule) -> WafResult<()> {
        let bytes = encode(rule)?;
        self.tiers.set(&Self::rule_key(rule.id), bytes, self.rule_ttl).await
    }

    pub async fn delete_rule(&self, id: i64) -> WafResult<()> {
        self.tiers.delete(&Self::rule_key(id)).await?;
        // The aggregate set is stale once any member changes.
        self.tiers.delete(RULE_SET_KEY).await
    }

    pub async fn get_rules(&self) -> WafResult<Option<Vec<Rule>>> {
        match self.tiers.get(RULE_SET_KEY).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn set_rules(&self, rules: &[Rule]) -> WafResult<()> {
        let bytes = encode(&rules)?;
        self.tiers.set(RULE_SET_KEY, bytes, self.rule_ttl).await
    }

    pub async fn clear(&self) -> WafResult<()> {
        debug!("clearing rule cache");
        self.tiers.clear().await
    }
}

fn encode<T: serde::Serialize>(value: &T) -> WafResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| WafError::cache_invalid(format!("encode failed: {e}")))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> WafResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| WafError::cache_invalid(format!("corrupt cache entry: {e}")))
}
