//! Detection rule types and the request/verdict model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::error::{WafError, WafResult};

/// Rule classification: which detection engine evaluates the rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Ip,
    Cc,
    Regex,
    Sqli,
    Xss,
    Custom,
}

impl std::fmt::Display for RuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RuleType::Ip => "ip",
            RuleType::Cc => "cc",
            RuleType::Regex => "regex",
            RuleType::Sqli => "sqli",
            RuleType::Xss => "xss",
            RuleType::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// Which part of the request the rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleVariable {
    RequestUri,
    RequestHeaders,
    RequestArgs,
    RequestBody,
    RequestMethod,
    Response,
}

/// Action taken when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Block,
    Allow,
    Log,
    Redirect,
    Captcha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

/// Top-level boolean combinator selected by a rule's `rules_operation` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleCombinator {
    And,
    Or,
    Not,
    Any,
    All,
}

/// A detection rule as stored and evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub pattern: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub rule_type: RuleType,
    pub variable: RuleVariable,
    pub action: ActionType,
    pub priority: i32,
    pub status: RuleStatus,
    pub severity: Severity,
    #[serde(default)]
    pub combinator: Option<RuleCombinator>,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub created_by: i64,
    #[serde(default)]
    pub updated_by: i64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    pub fn is_enabled(&self) -> bool {
        self.status == RuleStatus::Enabled
    }

    /// Validate structural invariants. Regex rules additionally pass the
    /// complexity bounds enforced by the regex matcher.
    pub fn validate(&self) -> WafResult<()> {
        if self.name.is_empty() {
            return Err(WafError::rule_validation("rule name must not be empty"));
        }
        if self.pattern.is_empty() {
            return Err(WafError::rule_validation("rule pattern must not be empty"));
        }
        if self.rule_type == RuleType::Regex {
            crate::matcher::regex::validate_pattern(&self.pattern)?;
            regex::Regex::new(&self.pattern).map_err(|e| {
                WafError::rule_validation(format!("invalid regex pattern: {e}"))
            })?;
        }
        Ok(())
    }

    /// Hex SHA-256 over the behavior-defining fields. Audit fields and the
    /// version stamp itself are excluded so the hash only changes when the
    /// rule's effect changes.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.pattern.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.rule_type.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.params.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(format!("{:?}|{:?}|{}", self.variable, self.action, self.priority));
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Descending priority, stable on ties.
pub fn sort_rules_by_priority(rules: &mut [Rule]) {
    rules.sort_by(|a, b| b.priority.cmp(&a.priority));
}

/// Descending priority of the owning rule, stable on ties.
pub fn sort_matches_by_priority(matches: &mut [RuleMatch]) {
    matches.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));
}

/// Filter for listing and exporting rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleQuery {
    pub rule_type: Option<RuleType>,
    pub status: Option<RuleStatus>,
    pub keyword: Option<String>,
    /// 1-based page; 0 disables pagination.
    pub page: u64,
    pub page_size: u64,
}

impl RuleQuery {
    pub fn enabled() -> Self {
        Self {
            status: Some(RuleStatus::Enabled),
            ..Default::default()
        }
    }
}

/// Inbound request description handed to `check`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckRequest {
    pub client_ip: String,
    pub uri: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub args: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    pub method: String,
    /// Empty means "evaluate every rule type".
    #[serde(default)]
    pub rule_types: Vec<RuleType>,
}

impl CheckRequest {
    pub fn validate(&self) -> WafResult<()> {
        if self.uri.is_empty() {
            return Err(WafError::validation("uri must not be empty"));
        }
        if self.client_ip.is_empty() {
            return Err(WafError::validation("client_ip must not be empty"));
        }
        if self.method.is_empty() {
            return Err(WafError::validation("method must not be empty"));
        }
        Ok(())
    }

    /// Whether the caller asked for this rule type (an empty filter admits
    /// everything).
    pub fn wants(&self, rule_type: RuleType) -> bool {
        self.rule_types.is_empty() || self.rule_types.contains(&rule_type)
    }
}

/// Verdict of a `check` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub matched: bool,
    pub action: ActionType,
    pub matched_rule: Option<Rule>,
    pub message: String,
}

impl CheckResult {
    pub fn no_match() -> Self {
        Self {
            matched: false,
            action: ActionType::Allow,
            matched_rule: None,
            message: "no match".to_string(),
        }
    }

    pub fn hit(rule: Rule, action: ActionType) -> Self {
        Self {
            matched: true,
            action,
            message: format!("hit: {}", rule.name),
            matched_rule: Some(rule),
        }
    }
}

/// A single positive from one of the base matchers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule: Rule,
    pub matched_str: String,
    pub position: usize,
    pub score: f64,
}

#[cfg(test)]
pub(crate) fn test_rule(id: i64, name: &str, pattern: &str) -> Rule {
    Rule {
        id,
        name: name.to_string(),
        description: String::new(),
        pattern: pattern.to_string(),
        params: serde_json::Value::Null,
        rule_type: RuleType::Regex,
        variable: RuleVariable::RequestUri,
        action: ActionType::Block,
        priority: 0,
        status: RuleStatus::Enabled,
        severity: Severity::Medium,
        combinator: None,
        version: 0,
        hash: String::new(),
        created_by: 0,
        updated_by: 0,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
