//! CC (request-rate) rule model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{WafError, WafResult};
use crate::model::rule::RuleStatus;

/// Unit the `time_window` field is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl LimitUnit {
    pub fn seconds(self) -> u64 {
        match self {
            LimitUnit::Second => 1,
            LimitUnit::Minute => 60,
            LimitUnit::Hour => 3600,
            LimitUnit::Day => 86_400,
        }
    }
}

/// Per-URI request-rate limit. One rule fires per exact URI match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CcRule {
    pub id: i64,
    pub uri: String,
    pub limit_rate: u32,
    pub time_window: u32,
    pub limit_unit: LimitUnit,
    pub status: RuleStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl CcRule {
    pub fn validate(&self) -> WafResult<()> {
        if self.uri.is_empty() {
            return Err(WafError::rule_validation("cc rule uri must not be empty"));
        }
        if self.limit_rate == 0 {
            return Err(WafError::rule_validation("limit_rate must be positive"));
        }
        if self.time_window == 0 {
            return Err(WafError::rule_validation("time_window must be positive"));
        }
        Ok(())
    }

    /// The sliding window this rule counts requests over.
    pub fn window(&self) -> Duration {
        Duration::from_secs(u64::from(self.time_window) * self.limit_unit.seconds())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CcRuleQuery {
    pub uri: Option<String>,
    pub status: Option<RuleStatus>,
    pub limit_unit: Option<LimitUnit>,
}
