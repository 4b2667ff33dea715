//! IP list rule model.

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::error::{WafError, WafResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpListType {
    White,
    Black,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    Permanent,
    Temporary,
}

/// A white/black-list entry for a single address or a CIDR range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpRule {
    pub id: i64,
    pub ip: String,
    pub ip_type: IpListType,
    pub block_type: BlockType,
    /// Required for temporary rules; the rule is inactive once `now` reaches
    /// this instant.
    #[serde(default)]
    pub expire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created_by: i64,
    #[serde(default)]
    pub updated_by: i64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl IpRule {
    pub fn validate(&self) -> WafResult<()> {
        self.network()?;
        if self.block_type == BlockType::Temporary {
            match self.expire_time {
                Some(t) if t > Utc::now() => {}
                Some(_) => {
                    return Err(WafError::rule_validation(
                        "expire_time must be in the future for temporary rules",
                    ))
                }
                None => {
                    return Err(WafError::rule_validation(
                        "temporary rules require an expire_time",
                    ))
                }
            }
        }
        Ok(())
    }

    /// Parse the `ip` field as a CIDR network; bare addresses become
    /// single-host networks.
    pub fn network(&self) -> WafResult<IpNetwork> {
        if let Ok(net) = self.ip.parse::<IpNetwork>() {
            return Ok(net);
        }
        self.ip
            .parse::<IpAddr>()
            .map(IpNetwork::from)
            .map_err(|_| WafError::rule_validation(format!("invalid ip or cidr: {}", self.ip)))
    }

    /// Whether the rule covers the given client address.
    pub fn covers(&self, addr: IpAddr) -> bool {
        self.network().map(|net| net.contains(addr)).unwrap_or(false)
    }

    /// Permanent rules never expire; temporary rules are active strictly
    /// before their expiry.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.block_type {
            BlockType::Permanent => true,
            BlockType::Temporary => self.expire_time.map(|t| now < t).unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpRuleQuery {
    pub keyword: Option<String>,
    pub ip_type: Option<IpListType>,
    pub block_type: Option<BlockType>,
}
