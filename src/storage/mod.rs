//! Storage contracts
//!
//! The engine owns no drivers: authoritative rule storage and the shared
//! key-value store are traits, with in-memory implementations shipped for
//! tests and single-node embedders. Real deployments back these with a
//! relational database and a Redis-class store.

pub mod memory;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::WafResult;
use crate::model::{
    CcRule, IpRule, IpRuleQuery, Rule, RuleAuditLog, RuleQuery, RuleStats, RuleSyncLog,
    RuleUpdateEvent, RuleVersion,
};

/// Shared key-value store: the cache tier, counters, and sliding windows all
/// live here.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// `Ok(None)` is a miss.
    async fn get(&self, key: &str) -> WafResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> WafResult<()>;

    async fn del(&self, key: &str) -> WafResult<()>;

    /// All live keys with the given prefix.
    async fn scan(&self, prefix: &str) -> WafResult<Vec<String>>;

    /// Atomic `INCR key; EXPIRE key ttl` pipeline. Returns the counter after
    /// the increment.
    async fn incr_with_expire(&self, key: &str, ttl: Duration) -> WafResult<i64>;

    /// Atomic increment without touching the TTL.
    async fn incr(&self, key: &str) -> WafResult<i64>;
}

/// Authoritative rule storage. Mutations stamp the global version, the
/// content hash, and append the matching version row in one transaction.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Insert and return the stored rule with id, version, and hash stamped.
    /// A duplicate name is a rule-conflict error.
    async fn create_rule(&self, rule: Rule) -> WafResult<Rule>;

    async fn update_rule(&self, rule: Rule) -> WafResult<Rule>;

    async fn delete_rule(&self, id: i64) -> WafResult<()>;

    async fn get_rule(&self, id: i64) -> WafResult<Option<Rule>>;

    async fn list_rules(&self, query: &RuleQuery) -> WafResult<(Vec<Rule>, u64)>;

    /// All-or-nothing batch insert.
    async fn batch_create_rules(&self, rules: Vec<Rule>) -> WafResult<Vec<Rule>>;

    /// All-or-nothing batch update.
    async fn batch_update_rules(&self, rules: Vec<Rule>) -> WafResult<Vec<Rule>>;

    /// All-or-nothing batch delete.
    async fn batch_delete_rules(&self, ids: &[i64]) -> WafResult<()>;

    /// Replace the live rule set with `rules` and record `event`, in one
    /// transaction. Used by rollback.
    async fn replace_all_rules(&self, rules: Vec<Rule>, event: RuleUpdateEvent) -> WafResult<()>;

    /// Current global rule-set version.
    async fn latest_version(&self) -> WafResult<i64>;

    async fn stats(&self) -> WafResult<RuleStats>;

    async fn create_audit_log(&self, log: RuleAuditLog) -> WafResult<()>;

    async fn list_audit_logs(&self, rule_id: i64) -> WafResult<Vec<RuleAuditLog>>;
}

/// Append-only version log plus sync/update records.
#[async_trait]
pub trait VersionStore: Send + Sync {
    async fn create_version(&self, version: RuleVersion) -> WafResult<()>;

    async fn get_version(&self, rule_id: i64, version: i64) -> WafResult<Option<RuleVersion>>;

    /// Versions for a rule, newest first.
    async fn list_versions(&self, rule_id: i64) -> WafResult<Vec<RuleVersion>>;

    /// The rule set as it was persisted at the given global version.
    async fn rules_at_version(&self, version: i64) -> WafResult<Vec<Rule>>;

    async fn create_sync_log(&self, log: RuleSyncLog) -> WafResult<()>;

    async fn list_sync_logs(&self, rule_id: i64) -> WafResult<Vec<RuleSyncLog>>;

    async fn list_update_events(&self) -> WafResult<Vec<RuleUpdateEvent>>;
}

/// CC rule storage.
#[async_trait]
pub trait CcRuleStore: Send + Sync {
    async fn create_cc_rule(&self, rule: CcRule) -> WafResult<CcRule>;

    async fn update_cc_rule(&self, rule: CcRule) -> WafResult<CcRule>;

    async fn delete_cc_rule(&self, id: i64) -> WafResult<()>;

    async fn get_cc_rule(&self, id: i64) -> WafResult<Option<CcRule>>;

    async fn list_cc_rules(&self) -> WafResult<Vec<CcRule>>;
}

/// IP rule storage.
#[async_trait]
pub trait IpRuleStore: Send + Sync {
    async fn create_ip_rule(&self, rule: IpRule) -> WafResult<IpRule>;

    async fn update_ip_rule(&self, rule: IpRule) -> WafResult<IpRule>;

    async fn delete_ip_rule(&self, id: i64) -> WafResult<()>;

    async fn get_ip_rule(&self, id: i64) -> WafResult<Option<IpRule>>;

    async fn list_ip_rules(&self, query: &IpRuleQuery) -> WafResult<Vec<IpRule>>;

    /// The first rule covering the address (literal or CIDR).
    async fn get_ip_rule_covering(&self, ip: &str) -> WafResult<Option<IpRule>>;

    /// Whether any rule exists with exactly this address field.
    async fn exists_by_ip(&self, ip: &str) -> WafResult<bool>;
}
