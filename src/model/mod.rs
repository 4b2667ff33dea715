//! Domain model: rules, requests, verdicts, and their lifecycle records.

pub mod cc;
pub mod ip;
pub mod rule;
pub mod version;

pub use cc::{CcRule, CcRuleQuery, LimitUnit};
pub use ip::{BlockType, IpListType, IpRule, IpRuleQuery};
pub use rule::{
    sort_matches_by_priority, sort_rules_by_priority, ActionType, CheckRequest, CheckResult, Rule,
    RuleCombinator, RuleMatch, RuleQuery, RuleStatus, RuleType, RuleVariable, Severity,
};
pub use version::{
    ChangeType, RuleAuditLog, RuleDiff, RuleStats, RuleSyncLog, RuleUpdateEvent, RuleVersion,
    SyncStatus,
};
