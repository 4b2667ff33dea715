//! Check orchestrator and rule lifecycle
//!
//! `RuleEngine` is the crate's entry point: it owns the authoritative store
//! handle, the two-tier rule cache, the per-type handlers, and the matcher
//! pipeline's derived indexes, and keeps them coherent across mutations and
//! reloads. `check` evaluates a request against the enabled rule set in
//! priority order and returns the first matching rule's action, transformed
//! by the current WAF mode.

use futures::FutureExt;
use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::RuleCache;
use crate::cancel::CancelToken;
use crate::config::{EngineConfig, WafMode};
use crate::error::{WafError, WafResult};
use crate::matcher::{AcMatcher, ParallelMatcher, RegexMatcher, TrieMatcher};
use crate::model::{
    sort_rules_by_priority, ChangeType, CheckRequest, CheckResult, Rule, RuleAuditLog, RuleMatch,
    RuleQuery, RuleStats, RuleSyncLog, RuleType, RuleUpdateEvent, SyncStatus,
};
use crate::service::cc::CcService;
use crate::service::handler::HandlerSet;
use crate::service::ip::IpService;
use crate::service::version::VersionService;
use crate::storage::memory::{MemoryKv, MemoryStore};
use crate::storage::{KvStore, RuleStore, VersionStore};
use crate::validator::InputValidator;

fn match_count_key(rule_id: i64) -> String {
    format!("rule:match:count:{rule_id}")
}

pub struct RuleEngine {
    store: Arc<dyn RuleStore>,
    cache: RuleCache,
    kv: Arc<dyn KvStore>,
    handlers: HandlerSet,
    pipeline: ParallelMatcher,
    versions: VersionService,
    mode: RwLock<WafMode>,
    cc: Option<Arc<CcService>>,
    ip: Option<Arc<IpService>>,
}

impl RuleEngine {
    pub fn new(
        store: Arc<dyn RuleStore>,
        version_store: Arc<dyn VersionStore>,
        kv: Arc<dyn KvStore>,
        config: EngineConfig,
    ) -> Self {
        let cache = RuleCache::new(
            kv.clone(),
            Duration::from_secs(config.local_cache_ttl_secs),
            Duration::from_secs(config.rule_cache_ttl_secs),
        );
        let handlers = HandlerSet::new(kv.clone(), InputValidator::new(config.max_input_len));
        let pipeline = ParallelMatcher::new(vec![
            Arc::new(TrieMatcher::new()),
            Arc::new(AcMatcher::new()),
            Arc::new(RegexMatcher::new()),
        ]);
        let _ = pipeline.set_workers(config.workers);

        Self {
            versions: VersionService::new(version_store, store.clone()),
            store,
            cache,
            kv,
            handlers,
            pipeline,
            mode: RwLock::new(WafMode::default()),
            cc: None,
            ip: None,
        }
    }

    /// Everything wired against the in-memory store and KV; handy for tests
    /// and single-node embedding.
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKv::new());
        let config = EngineConfig::default();
        let cc = Arc::new(CcService::new(store.clone(), kv.clone()));
        let ip = Arc::new(IpService::new(
            store.clone(),
            kv.clone(),
            Duration::from_secs(config.ip_verdict_ttl_secs),
        ));
        Self::new(store.clone(), store, kv, config)
            .with_cc_service(cc)
            .with_ip_service(ip)
    }

    pub fn with_cc_service(mut self, cc: Arc<CcService>) -> Self {
        self.cc = Some(cc);
        self
    }

    pub fn with_ip_service(mut self, ip: Arc<IpService>) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn cc_service(&self) -> Option<&Arc<CcService>> {
        self.cc.as_ref()
    }

    pub fn ip_service(&self) -> Option<&Arc<IpService>> {
        self.ip.as_ref()
    }

    pub fn version_service(&self) -> &VersionService {
        &self.versions
    }

    pub fn mode(&self) -> WafMode {
        *self.mode.read()
    }

    pub fn set_mode(&self, mode: WafMode) {
        info!(?mode, "waf mode changed");
        *self.mode.write() = mode;
    }

    // ------------------------------------------------------------------
    // Check path
    // ------------------------------------------------------------------

    /// Evaluate a request against the enabled rule set. Never panics for
    /// input reasons: a recovered panic surfaces as a system error.
    pub async fn check(&self, cancel: &CancelToken, req: &CheckRequest) -> WafResult<CheckResult> {
        match AssertUnwindSafe(self.check_inner(cancel, req))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => Err(WafError::system("panic recovered during check")),
        }
    }

    async fn check_inner(&self, cancel: &CancelToken, req: &CheckRequest) -> WafResult<CheckResult> {
        req.validate()?;

        // Whitelisted clients skip rule evaluation entirely.
        if let Some(ip) = &self.ip {
            if ip.is_whitelisted(cancel, &req.client_ip).await? {
                debug!(client_ip = %req.client_ip, "client whitelisted, skipping rules");
                return Ok(CheckResult::no_match());
            }
        }

        let mut rules = self.load_enabled_rules().await?;
        sort_rules_by_priority(&mut rules);

        for rule in rules {
            if !req.wants(rule.rule_type) {
                continue;
            }

            let matched = self.handlers.match_rule(cancel, &rule, req).await?;
            if !matched {
                continue;
            }

            // Best-effort hit counter; a failure never changes the verdict.
            if let Err(err) = self.incr_rule_match_count(rule.id).await {
                warn!(rule_id = rule.id, error = %err, "failed to bump match counter");
            }

            let action = self.mode().apply(rule.action);
            info!(
                rule_id = rule.id,
                rule_name = %rule.name,
                declared = ?rule.action,
                effective = ?action,
                uri = %req.uri,
                client_ip = %req.client_ip,
                "rule hit"
            );
            return Ok(CheckResult::hit(rule, action));
        }

        Ok(CheckResult::no_match())
    }

    /// Ordered matches from the matcher pipeline's derived indexes (trie,
    /// AC automaton, regex) for callers that need every hit rather than the
    /// first action.
    pub async fn scan_request(
        &self,
        cancel: &CancelToken,
        req: &CheckRequest,
    ) -> WafResult<Vec<RuleMatch>> {
        self.pipeline.match_request(cancel, req).await
    }

    async fn load_enabled_rules(&self) -> WafResult<Vec<Rule>> {
        match self.cache.get_rules().await {
            Ok(Some(rules)) => {
                return Ok(rules.into_iter().filter(Rule::is_enabled).collect());
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "rule cache read failed, falling back to store");
            }
        }

        let (rules, _) = self.store.list_rules(&RuleQuery::default()).await?;
        if let Err(err) = self.cache.set_rules(&rules).await {
            warn!(error = %err, "failed to backfill rule cache");
        }
        Ok(rules.into_iter().filter(Rule::is_enabled).collect())
    }

    // ------------------------------------------------------------------
    // Rule lifecycle
    // ------------------------------------------------------------------

    pub async fn create_rule(&self, rule: Rule) -> WafResult<Rule> {
        rule.validate()?;
        let stored = self.store.create_rule(rule).await?;
        self.after_mutation(&stored, ChangeType::Create).await;
        Ok(stored)
    }

    pub async fn update_rule(&self, rule: Rule) -> WafResult<Rule> {
        rule.validate()?;
        let stored = self.store.update_rule(rule).await?;
        self.after_mutation(&stored, ChangeType::Update).await;
        Ok(stored)
    }

    pub async fn delete_rule(&self, id: i64) -> WafResult<()> {
        let old = self.store.get_rule(id).await?;
        self.store.delete_rule(id).await?;

        if let Err(err) = self.cache.delete_rule(id).await {
            warn!(rule_id = id, error = %err, "cache invalidation failed");
        }
        self.handlers.invalidate(id);
        if let Err(err) = self.pipeline.remove(id) {
            if !err.is_not_found() {
                warn!(rule_id = id, error = %err, "failed to deindex rule");
            }
        }
        if let Some(old) = old {
            self.audit(&old, "delete", Some(&old), None).await;
        }
        Ok(())
    }

    pub async fn get_rule(&self, id: i64) -> WafResult<Option<Rule>> {
        match self.cache.get_rule(id).await {
            Ok(Some(rule)) => return Ok(Some(rule)),
            Ok(None) => {}
            Err(err) => warn!(rule_id = id, error = %err, "rule cache read failed"),
        }

        let rule = self.store.get_rule(id).await?;
        if let Some(rule) = &rule {
            // Self-heal: repopulate on miss.
            if let Err(err) = self.cache.set_rule(rule).await {
                warn!(rule_id = id, error = %err, "failed to backfill rule cache");
            }
        }
        Ok(rule)
    }

    pub async fn list_rules(&self, query: &RuleQuery) -> WafResult<(Vec<Rule>, u64)> {
        self.store.list_rules(query).await
    }

    pub async fn batch_create_rules(&self, rules: Vec<Rule>) -> WafResult<Vec<Rule>> {
        for rule in &rules {
            rule.validate()?;
        }
        let stored = self.store.batch_create_rules(rules).await?;
        for rule in &stored {
            self.after_mutation(rule, ChangeType::Create).await;
        }
        Ok(stored)
    }

    pub async fn batch_update_rules(&self, rules: Vec<Rule>) -> WafResult<Vec<Rule>> {
        for rule in &rules {
            rule.validate()?;
        }
        let stored = self.store.batch_update_rules(rules).await?;
        for rule in &stored {
            self.after_mutation(rule, ChangeType::Update).await;
        }
        Ok(stored)
    }

    pub async fn batch_delete_rules(&self, ids: &[i64]) -> WafResult<()> {
        self.store.batch_delete_rules(ids).await?;
        for &id in ids {
            if let Err(err) = self.cache.delete_rule(id).await {
                warn!(rule_id = id, error = %err, "cache invalidation failed");
            }
            self.handlers.invalidate(id);
            if let Err(err) = self.pipeline.remove(id) {
                if !err.is_not_found() {
                    warn!(rule_id = id, error = %err, "failed to deindex rule");
                }
            }
        }
        Ok(())
    }

    /// Import is a validated batch create.
    pub async fn import_rules(&self, rules: Vec<Rule>) -> WafResult<Vec<Rule>> {
        self.batch_create_rules(rules).await
    }

    /// Export every rule matching the query, unpaginated.
    pub async fn export_rules(&self, query: &RuleQuery) -> WafResult<Vec<Rule>> {
        let mut query = query.clone();
        query.page = 0;
        query.page_size = 0;
        let (rules, _) = self.store.list_rules(&query).await?;
        Ok(rules)
    }

    pub async fn stats(&self) -> WafResult<RuleStats> {
        self.store.stats().await
    }

    pub async fn list_audit_logs(&self, rule_id: i64) -> WafResult<Vec<RuleAuditLog>> {
        self.store.list_audit_logs(rule_id).await
    }

    /// Post-mutation bookkeeping: invalidate both cache tiers and the
    /// compiled-pattern caches, then update the matcher pipeline's indexes.
    /// The store is already committed, so failures here are logged and left
    /// for the next reload to repair.
    async fn after_mutation(&self, rule: &Rule, change: ChangeType) {
        if let Err(err) = self.cache.delete_rule(rule.id).await {
            warn!(rule_id = rule.id, error = %err, "cache invalidation failed");
        }
        self.handlers.invalidate(rule.id);

        if change == ChangeType::Update {
            if let Err(err) = self.pipeline.remove(rule.id) {
                if !err.is_not_found() {
                    warn!(rule_id = rule.id, error = %err, "failed to deindex rule");
                }
            }
        }
        if rule.rule_type == RuleType::Regex {
            if let Err(err) = self.pipeline.add(rule) {
                warn!(rule_id = rule.id, error = %err, "failed to index rule");
            }
        }

        self.audit(rule, &change.to_string(), None, Some(rule)).await;
    }

    async fn audit(&self, rule: &Rule, action: &str, old: Option<&Rule>, new: Option<&Rule>) {
        let encode = |r: Option<&Rule>| {
            r.and_then(|r| serde_json::to_string(r).ok()).unwrap_or_default()
        };
        let log = RuleAuditLog {
            id: 0,
            rule_id: rule.id,
            action: action.to_string(),
            operator: rule.updated_by.to_string(),
            old_value: encode(old),
            new_value: encode(new),
            created_at: chrono::Utc::now(),
        };
        if let Err(err) = self.store.create_audit_log(log).await {
            warn!(rule_id = rule.id, error = %err, "failed to write audit log");
        }
    }

    // ------------------------------------------------------------------
    // Versioning and reload
    // ------------------------------------------------------------------

    pub async fn get_version(&self) -> WafResult<i64> {
        self.store.latest_version().await
    }

    /// Clear the rule cache and refill it from the authoritative store,
    /// rebuild the matcher pipeline, and reset CC windows. After this
    /// returns, every subsequent check sees exactly the reloaded set.
    pub async fn reload_rules(&self, cancel: &CancelToken) -> WafResult<()> {
        cancel.ensure_active()?;
        self.cache.clear().await?;

        let (rules, _) = self.store.list_rules(&RuleQuery::default()).await?;

        self.pipeline.clear()?;
        for rule in &rules {
            self.handlers.invalidate(rule.id);

            let cached = self.cache.set_rule(rule).await;
            let status = if cached.is_ok() {
                SyncStatus::Success
            } else {
                SyncStatus::Failed
            };
            if let Err(err) = &cached {
                warn!(rule_id = rule.id, error = %err, "failed to cache rule on reload");
            }

            if rule.rule_type == RuleType::Regex {
                if let Err(err) = self.pipeline.add(rule) {
                    warn!(rule_id = rule.id, error = %err, "failed to index rule on reload");
                }
            }

            let log = RuleSyncLog {
                id: 0,
                rule_id: rule.id,
                version: rule.version,
                status,
                message: match &cached {
                    Ok(()) => "rule reloaded".to_string(),
                    Err(err) => err.to_string(),
                },
                sync_type: "reload".to_string(),
                created_at: chrono::Utc::now(),
            };
            if let Err(err) = self.versions.record_sync_log(log).await {
                warn!(rule_id = rule.id, error = %err, "failed to write sync log");
            }
        }

        if let Err(err) = self.cache.set_rules(&rules).await {
            warn!(error = %err, "failed to cache rule set on reload");
        }

        if let Some(cc) = &self.cc {
            cc.reload(cancel).await?;
        }

        info!(rules = rules.len(), "rule set reloaded");
        Ok(())
    }

    /// Replace the live rule set with the snapshot at `version` and reload.
    pub async fn rollback_to(
        &self,
        cancel: &CancelToken,
        version: i64,
    ) -> WafResult<RuleUpdateEvent> {
        let event = self.versions.rollback_to(version).await?;
        self.reload_rules(cancel).await?;
        Ok(event)
    }

    // ------------------------------------------------------------------
    // Match counters
    // ------------------------------------------------------------------

    pub async fn incr_rule_match_count(&self, rule_id: i64) -> WafResult<i64> {
        self.kv.incr(&match_count_key(rule_id)).await
    }

    pub async fn get_rule_match_count(&self, rule_id: i64) -> WafResult<i64> {
        let Some(bytes) = self.kv.get(&match_count_key(rule_id)).await? else {
            return Ok(0);
        };
        std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| WafError::cache_invalid("corrupt match counter"))
    }
}
