//! Rule lifecycle records: versions, sync logs, update events, audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::rule::{ActionType, RuleStatus};

/// What kind of mutation produced a version row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
    Rollback,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChangeType::Create => "create",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
            ChangeType::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// Append-only snapshot of a rule at a global version. `(rule_id, version)`
/// is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleVersion {
    pub id: i64,
    pub rule_id: i64,
    pub version: i64,
    pub hash: String,
    /// Serialized rule at this version.
    pub content: String,
    pub change_type: ChangeType,
    pub status: RuleStatus,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Failed,
}

/// One row per rule per reload/sync attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSyncLog {
    pub id: i64,
    pub rule_id: i64,
    pub version: i64,
    pub status: SyncStatus,
    pub message: String,
    pub sync_type: String,
    pub created_at: DateTime<Utc>,
}

/// Per-rule slice of an update event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDiff {
    pub rule_id: i64,
    pub name: String,
    pub pattern: String,
    pub action: ActionType,
    pub status: RuleStatus,
    pub version: i64,
    pub update_type: ChangeType,
    pub update_time: DateTime<Utc>,
}

/// A rule-set level change: batch mutation or rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleUpdateEvent {
    pub id: i64,
    pub version: i64,
    pub action: ChangeType,
    pub diffs: Vec<RuleDiff>,
    pub created_at: DateTime<Utc>,
}

/// Who changed what, for the admin audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleAuditLog {
    pub id: i64,
    pub rule_id: i64,
    pub action: String,
    pub operator: String,
    pub old_value: String,
    pub new_value: String,
    pub created_at: DateTime<Utc>,
}

/// Aggregate counts over the live rule set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleStats {
    pub total_rules: u64,
    pub enabled_rules: u64,
    pub disabled_rules: u64,
    pub high_risk_rules: u64,
    pub medium_risk_rules: u64,
    pub low_risk_rules: u64,
    pub sqli_rules: u64,
    pub xss_rules: u64,
    pub cc_rules: u64,
    pub custom_rules: u64,
}
