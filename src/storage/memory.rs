//! In-memory storage
//!
//! `MemoryStore` backs the rule, version, CC, and IP store traits with one
//! mutex-guarded state block, so multi-row mutations are naturally
//! transactional. `MemoryKv` is a DashMap with per-entry expiry. Both exist
//! for tests and single-node embedding; production deployments substitute
//! database- and Redis-backed implementations.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::error::{WafError, WafResult};
use crate::model::{
    CcRule, ChangeType, IpRule, IpRuleQuery, Rule, RuleAuditLog, RuleQuery, RuleStats, RuleStatus,
    RuleSyncLog, RuleType, RuleUpdateEvent, RuleVersion, Severity,
};
use crate::storage::{CcRuleStore, IpRuleStore, KvStore, RuleStore, VersionStore};

#[derive(Default)]
struct MemoryState {
    rules: BTreeMap<i64, Rule>,
    next_rule_id: i64,
    versions: Vec<RuleVersion>,
    next_version_row_id: i64,
    global_version: i64,
    sync_logs: Vec<RuleSyncLog>,
    update_events: Vec<RuleUpdateEvent>,
    audit_logs: Vec<RuleAuditLog>,
    cc_rules: BTreeMap<i64, CcRule>,
    next_cc_id: i64,
    ip_rules: BTreeMap<i64, IpRule>,
    next_ip_id: i64,
}

impl MemoryState {
    fn name_conflicts(&self, name: &str, own_id: i64) -> bool {
        self.rules
            .values()
            .any(|r| r.name == name && r.id != own_id)
    }

    fn append_version(&mut self, rule: &Rule, change_type: ChangeType) -> WafResult<()> {
        let content = serde_json::to_string(rule)
            .map_err(|e| WafError::system(format!("failed to serialize rule: {e}")))?;
        self.next_version_row_id += 1;
        self.versions.push(RuleVersion {
            id: self.next_version_row_id,
            rule_id: rule.id,
            version: rule.version,
            hash: rule.hash.clone(),
            content,
            change_type,
            status: rule.status,
            created_by: rule.updated_by,
            created_at: Utc::now(),
        });
        Ok(())
    }

    /// Stamp a mutated rule with the next global version and its content
    /// hash, then append the version row.
    fn commit_rule(&mut self, mut rule: Rule, change_type: ChangeType) -> WafResult<Rule> {
        self.global_version += 1;
        rule.version = self.global_version;
        rule.hash = rule.content_hash();
        rule.updated_at = Utc::now();
        self.append_version(&rule, change_type)?;
        self.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }
}

/// In-memory authoritative store for rules, versions, CC and IP rules.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn create_rule(&self, mut rule: Rule) -> WafResult<Rule> {
        let mut state = self.state.lock();
        if state.name_conflicts(&rule.name, 0) {
            return Err(WafError::rule_conflict(format!(
                "rule name already exists: {}",
                rule.name
            )));
        }
        state.next_rule_id += 1;
        rule.id = state.next_rule_id;
        rule.created_at = Utc::now();
        state.commit_rule(rule, ChangeType::Create)
    }

    async fn update_rule(&self, rule: Rule) -> WafResult<Rule> {
        let mut state = self.state.lock();
        if !state.rules.contains_key(&rule.id) {
            return Err(WafError::rule_not_found(format!("rule not found: {}", rule.id)));
        }
        if state.name_conflicts(&rule.name, rule.id) {
            return Err(WafError::rule_conflict(format!(
                "rule name already exists: {}",
                rule.name
            )));
        }
        state.commit_rule(rule, ChangeType::Update)
    }

    async fn delete_rule(&self, id: i64) -> WafResult<()> {
        let mut state = self.state.lock();
        let Some(rule) = state.rules.remove(&id) else {
            return Err(WafError::rule_not_found(format!("rule not found: {id}")));
        };
        state.global_version += 1;
        let mut tombstone = rule;
        tombstone.version = state.global_version;
        state.append_version(&tombstone, ChangeType::Delete)?;
        Ok(())
    }

    async fn get_rule(&self, id: i64) -> WafResult<Option<Rule>> {
        Ok(self.state.lock().rules.get(&id).cloned())
    }

    async fn list_rules(&self, query: &RuleQuery) -> WafResult<(Vec<Rule>, u64)> {
        let state = self.state.lock();
        let filtered: Vec<Rule> = state
            .rules
            .values()
            .filter(|r| query.rule_type.map_or(true, |t| r.rule_type == t))
            .filter(|r| query.status.map_or(true, |s| r.status == s))
            .filter(|r| {
                query.keyword.as_deref().map_or(true, |kw| {
                    r.name.contains(kw) || r.description.contains(kw) || r.pattern.contains(kw)
                })
            })
            .cloned()
            .collect();
        let total = filtered.len() as u64;

        if query.page == 0 || query.page_size == 0 {
            return Ok((filtered, total));
        }
        let start = ((query.page - 1) * query.page_size) as usize;
        let page = filtered
            .into_iter()
            .skip(start)
            .take(query.page_size as usize)
            .collect();
        Ok((page, total))
    }

    async fn batch_create_rules(&self, rules: Vec<Rule>) -> WafResult<Vec<Rule>> {
        let mut state = self.state.lock();

        // Conflict check over the whole batch before any insert.
        for rule in &rules {
            if state.name_conflicts(&rule.name, 0) {
                return Err(WafError::rule_conflict(format!(
                    "rule name already exists: {}",
                    rule.name
                )));
            }
        }
        let mut names = std::collections::HashSet::new();
        for rule in &rules {
            if !names.insert(rule.name.as_str()) {
                return Err(WafError::rule_conflict(format!(
                    "duplicate rule name in batch: {}",
                    rule.name
                )));
            }
        }

        let mut stored = Vec::with_capacity(rules.len());
        for mut rule in rules {
            state.next_rule_id += 1;
            rule.id = state.next_rule_id;
            rule.created_at = Utc::now();
            stored.push(state.commit_rule(rule, ChangeType::Create)?);
        }
        Ok(stored)
    }

    async fn batch_update_rules(&self, rules: Vec<Rule>) -> WafResult<Vec<Rule>> {
        let mut state = self.state.lock();
        for rule in &rules {
            if !state.rules.contains_key(&rule.id) {
                return Err(WafError::rule_not_found(format!("rule not found: {}", rule.id)));
            }
            if state.name_conflicts(&rule.name, rule.id) {
                return Err(WafError::rule_conflict(format!(
                    "rule name already exists: {}",
                    rule.name
                )));
            }
        }

        let mut stored = Vec::with_capacity(rules.len());
        for rule in rules {
            stored.push(state.commit_rule(rule, ChangeType::Update)?);
        }
        Ok(stored)
    }

    async fn batch_delete_rules(&self, ids: &[i64]) -> WafResult<()> {
        let mut state = self.state.lock();
        for id in ids {
            if !state.rules.contains_key(id) {
                return Err(WafError::rule_not_found(format!("rule not found: {id}")));
            }
        }
        for id in ids {
            let Some(rule) = state.rules.remove(id) else {
                continue;
            };
            state.global_version += 1;
            let mut tombstone = rule;
            tombstone.version = state.global_version;
            state.append_version(&tombstone, ChangeType::Delete)?;
        }
        Ok(())
    }

    async fn replace_all_rules(&self, rules: Vec<Rule>, event: RuleUpdateEvent) -> WafResult<()> {
        let mut state = self.state.lock();
        state.rules.clear();
        let version = event.version;
        for mut rule in rules {
            rule.version = version;
            state.append_version(&rule, ChangeType::Rollback)?;
            state.rules.insert(rule.id, rule);
        }
        state.global_version = version;
        state.update_events.push(event);
        Ok(())
    }

    async fn latest_version(&self) -> WafResult<i64> {
        Ok(self.state.lock().global_version)
    }

    async fn stats(&self) -> WafResult<RuleStats> {
        let state = self.state.lock();
        let mut stats = RuleStats::default();
        for rule in state.rules.values() {
            stats.total_rules += 1;
            match rule.status {
                RuleStatus::Enabled => stats.enabled_rules += 1,
                RuleStatus::Disabled => stats.disabled_rules += 1,
            }
            match rule.severity {
                Severity::High => stats.high_risk_rules += 1,
                Severity::Medium => stats.medium_risk_rules += 1,
                Severity::Low => stats.low_risk_rules += 1,
            }
            match rule.rule_type {
                RuleType::Sqli => stats.sqli_rules += 1,
                RuleType::Xss => stats.xss_rules += 1,
                RuleType::Cc => stats.cc_rules += 1,
                RuleType::Custom => stats.custom_rules += 1,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn create_audit_log(&self, mut log: RuleAuditLog) -> WafResult<()> {
        let mut state = self.state.lock();
        log.id = state.audit_logs.len() as i64 + 1;
        state.audit_logs.push(log);
        Ok(())
    }

    async fn list_audit_logs(&self, rule_id: i64) -> WafResult<Vec<RuleAuditLog>> {
        Ok(self
            .state
            .lock()
            .audit_logs
            .iter()
            .filter(|l| l.rule_id == rule_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl VersionStore for MemoryStore {
    async fn create_version(&self, mut version: RuleVersion) -> WafResult<()> {
        let mut state = self.state.lock();
        if state
            .versions
            .iter()
            .any(|v| v.rule_id == version.rule_id && v.version == version.version)
        {
            return Err(WafError::rule_conflict(format!(
                "version already exists: rule {} version {}",
                version.rule_id, version.version
            )));
        }
        state.next_version_row_id += 1;
        version.id = state.next_version_row_id;
        state.versions.push(version);
        Ok(())
    }

    async fn get_version(&self, rule_id: i64, version: i64) -> WafResult<Option<RuleVersion>> {
        Ok(self
            .state
            .lock()
            .versions
            .iter()
            .find(|v| v.rule_id == rule_id && v.version == version)
            .cloned())
    }

    async fn list_versions(&self, rule_id: i64) -> WafResult<Vec<RuleVersion>> {
        let mut versions: Vec<RuleVersion> = self
            .state
            .lock()
            .versions
            .iter()
            .filter(|v| v.rule_id == rule_id)
            .cloned()
            .collect();
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }

    async fn rules_at_version(&self, version: i64) -> WafResult<Vec<Rule>> {
        let state = self.state.lock();

        // For every rule, its most recent version row at or before the
        // target; delete tombstones drop the rule from the snapshot.
        let mut latest: BTreeMap<i64, &RuleVersion> = BTreeMap::new();
        for row in state.versions.iter().filter(|v| v.version <= version) {
            let keep = match latest.get(&row.rule_id) {
                Some(existing) => row.version > existing.version,
                None => true,
            };
            if keep {
                latest.insert(row.rule_id, row);
            }
        }

        let mut rules = Vec::new();
        for row in latest.values() {
            if row.change_type == ChangeType::Delete {
                continue;
            }
            let rule: Rule = serde_json::from_str(&row.content)
                .map_err(|e| WafError::system(format!("corrupt version content: {e}")))?;
            rules.push(rule);
        }
        Ok(rules)
    }

    async fn create_sync_log(&self, mut log: RuleSyncLog) -> WafResult<()> {
        let mut state = self.state.lock();
        log.id = state.sync_logs.len() as i64 + 1;
        state.sync_logs.push(log);
        Ok(())
    }

    async fn list_sync_logs(&self, rule_id: i64) -> WafResult<Vec<RuleSyncLog>> {
        Ok(self
            .state
            .lock()
            .sync_logs
            .iter()
            .filter(|l| l.rule_id == rule_id)
            .cloned()
            .collect())
    }

    async fn list_update_events(&self) -> WafResult<Vec<RuleUpdateEvent>> {
        Ok(self.state.lock().update_events.clone())
    }
}

#[async_trait]
impl CcRuleStore for MemoryStore {
    async fn create_cc_rule(&self, mut rule: CcRule) -> WafResult<CcRule> {
        let mut state = self.state.lock();
        state.next_cc_id += 1;
        rule.id = state.next_cc_id;
        rule.created_at = Utc::now();
        rule.updated_at = rule.created_at;
        state.cc_rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn update_cc_rule(&self, mut rule: CcRule) -> WafResult<CcRule> {
        let mut state = self.state.lock();
        if !state.cc_rules.contains_key(&rule.id) {
            return Err(WafError::rule_not_found(format!("cc rule not found: {}", rule.id)));
        }
        rule.updated_at = Utc::now();
        state.cc_rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn delete_cc_rule(&self, id: i64) -> WafResult<()> {
        if self.state.lock().cc_rules.remove(&id).is_none() {
            return Err(WafError::rule_not_found(format!("cc rule not found: {id}")));
        }
        Ok(())
    }

    async fn get_cc_rule(&self, id: i64) -> WafResult<Option<CcRule>> {
        Ok(self.state.lock().cc_rules.get(&id).cloned())
    }

    async fn list_cc_rules(&self) -> WafResult<Vec<CcRule>> {
        Ok(self.state.lock().cc_rules.values().cloned().collect())
    }
}

#[async_trait]
impl IpRuleStore for MemoryStore {
    async fn create_ip_rule(&self, mut rule: IpRule) -> WafResult<IpRule> {
        let mut state = self.state.lock();
        state.next_ip_id += 1;
        rule.id = state.next_ip_id;
        rule.created_at = Utc::now();
        rule.updated_at = rule.created_at;
        state.ip_rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn update_ip_rule(&self, mut rule: IpRule) -> WafResult<IpRule> {
        let mut state = self.state.lock();
        if !state.ip_rules.contains_key(&rule.id) {
            return Err(WafError::rule_not_found(format!("ip rule not found: {}", rule.id)));
        }
        rule.updated_at = Utc::now();
        state.ip_rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn delete_ip_rule(&self, id: i64) -> WafResult<()> {
        if self.state.lock().ip_rules.remove(&id).is_none() {
            return Err(WafError::rule_not_found(format!("ip rule not found: {id}")));
        }
        Ok(())
    }

    async fn get_ip_rule(&self, id: i64) -> WafResult<Option<IpRule>> {
        Ok(self.state.lock().ip_rules.get(&id).cloned())
    }

    async fn list_ip_rules(&self, query: &IpRuleQuery) -> WafResult<Vec<IpRule>> {
        Ok(self
            .state
            .lock()
            .ip_rules
            .values()
            .filter(|r| query.ip_type.map_or(true, |t| r.ip_type == t))
            .filter(|r| query.block_type.map_or(true, |t| r.block_type == t))
            .filter(|r| {
                query.keyword.as_deref().map_or(true, |kw| {
                    r.ip.contains(kw) || r.description.contains(kw)
                })
            })
            .cloned()
            .collect())
    }

    async fn get_ip_rule_covering(&self, ip: &str) -> WafResult<Option<IpRule>> {
        let addr: IpAddr = ip
            .parse()
            .map_err(|_| WafError::validation(format!("invalid ip address: {ip}")))?;
        Ok(self
            .state
            .lock()
            .ip_rules
            .values()
            .find(|r| r.covers(addr))
            .cloned())
    }

    async fn exists_by_ip(&self, ip: &str) -> WafResult<bool> {
        Ok(self.state.lock().ip_rules.values().any(|r| r.ip == ip))
    }
}

struct KvEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |t| Instant::now() < t)
    }
}

/// DashMap-backed KV with per-entry expiry, standing in for the shared
/// Redis-class store.
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, KvEntry>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> WafResult<Option<Vec<u8>>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.live() {
                return Ok(Some(entry.value.clone()));
            }
        }
        // Expired entries are removed lazily.
        self.entries.remove_if(key, |_, e| !e.live());
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> WafResult<()> {
        self.entries.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> WafResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> WafResult<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().live())
            .map(|e| e.key().clone())
            .collect())
    }

    async fn incr_with_expire(&self, key: &str, ttl: Duration) -> WafResult<i64> {
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| KvEntry {
            value: b"0".to_vec(),
            expires_at: Some(Instant::now() + ttl),
        });
        let current = if entry.live() {
            std::str::from_utf8(&entry.value)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0)
        } else {
            0
        };
        let next = current + 1;
        entry.value = next.to_string().into_bytes();
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(next)
    }

    async fn incr(&self, key: &str) -> WafResult<i64> {
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| KvEntry {
            value: b"0".to_vec(),
            expires_at: None,
        });
        let current = std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        entry.value = next.to_string().into_bytes();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::rule::test_rule;

    #[tokio::test]
    async fn test_rule_crud_bumps_versions() {
        let store = MemoryStore::new();

        let created = store.create_rule(test_rule(0, "r1", "/a")).await.unwrap();
        assert_eq!(created.version, 1);
        assert!(!created.hash.is_empty());

        let mut updated = created.clone();
        updated.pattern = "/b".to_string();
        let updated = store.update_rule(updated).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_ne!(updated.hash, created.hash);

        let versions = store.list_versions(created.id).await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version, 2);
        assert_eq!(versions[0].change_type, ChangeType::Update);
        assert_eq!(versions[1].change_type, ChangeType::Create);

        store.delete_rule(created.id).await.unwrap();
        assert!(store.get_rule(created.id).await.unwrap().is_none());
        assert_eq!(store.latest_version().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_name_uniqueness_enforced() {
        let store = MemoryStore::new();
        store.create_rule(test_rule(0, "dup", "/a")).await.unwrap();

        let err = store.create_rule(test_rule(0, "dup", "/b")).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::RuleConflict);
    }

    #[tokio::test]
    async fn test_batch_create_is_atomic() {
        let store = MemoryStore::new();
        store.create_rule(test_rule(0, "existing", "/a")).await.unwrap();

        let batch = vec![test_rule(0, "new", "/b"), test_rule(0, "existing", "/c")];
        assert!(store.batch_create_rules(batch).await.is_err());

        // Nothing from the failed batch landed.
        let (rules, total) = store.list_rules(&RuleQuery::default()).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(rules[0].name, "existing");
    }

    #[tokio::test]
    async fn test_rules_at_version_snapshot() {
        let store = MemoryStore::new();
        let r1 = store.create_rule(test_rule(0, "r1", "/v1")).await.unwrap(); // v1

        let mut r1b = r1.clone();
        r1b.pattern = "/v2".to_string();
        store.update_rule(r1b).await.unwrap(); // v2
        store.create_rule(test_rule(0, "r2", "/x")).await.unwrap(); // v3

        let at_v1 = store.rules_at_version(1).await.unwrap();
        assert_eq!(at_v1.len(), 1);
        assert_eq!(at_v1[0].pattern, "/v1");

        let at_v3 = store.rules_at_version(3).await.unwrap();
        assert_eq!(at_v3.len(), 2);

        store.delete_rule(r1.id).await.unwrap(); // v4
        let at_v4 = store.rules_at_version(4).await.unwrap();
        assert_eq!(at_v4.len(), 1);
        assert_eq!(at_v4[0].name, "r2");
    }

    #[tokio::test]
    async fn test_kv_ttl_expiry() {
        let kv = MemoryKv::new();
        kv.set("k", b"v".to_vec(), Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_kv_incr_with_expire() {
        let kv = MemoryKv::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(kv.incr_with_expire("c", ttl).await.unwrap(), 1);
        assert_eq!(kv.incr_with_expire("c", ttl).await.unwrap(), 2);
        assert_eq!(kv.incr_with_expire("c", ttl).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_kv_scan_by_prefix() {
        let kv = MemoryKv::new();
        kv.set("cc_limit:/a", b"1".to_vec(), None).await.unwrap();
        kv.set("cc_limit:/b", b"1".to_vec(), None).await.unwrap();
        kv.set("other", b"1".to_vec(), None).await.unwrap();

        let mut keys = kv.scan("cc_limit:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["cc_limit:/a", "cc_limit:/b"]);
    }

    #[tokio::test]
    async fn test_ip_rule_covering_lookup() {
        let store = MemoryStore::new();
        let rule = IpRule {
            id: 0,
            ip: "10.0.0.0/8".to_string(),
            ip_type: crate::model::IpListType::Black,
            block_type: crate::model::BlockType::Permanent,
            expire_time: None,
            description: String::new(),
            created_by: 0,
            updated_by: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.create_ip_rule(rule).await.unwrap();

        assert!(store
            .get_ip_rule_covering("10.1.2.3")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get_ip_rule_covering("192.168.0.1")
            .await
            .unwrap()
            .is_none());
        assert!(store.get_ip_rule_covering("bogus").await.is_err());
    }
}
