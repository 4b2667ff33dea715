//! Engine configuration and run mode.

use serde::{Deserialize, Serialize};

use crate::model::ActionType;

/// Global WAF run mode. The engine only reads it; mode changes come from
/// outside (admin API, config reload).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WafMode {
    /// Apply each matched rule's action verbatim.
    #[default]
    Block,
    /// Downgrade `block` to `log`; everything else verbatim.
    Alert,
    /// Short-circuit every matched action to `allow` (hits are still logged).
    Bypass,
}

impl WafMode {
    /// Transform a matched rule's declared action under this mode.
    pub fn apply(self, action: ActionType) -> ActionType {
        match self {
            WafMode::Block => action,
            WafMode::Alert => {
                if action == ActionType::Block {
                    ActionType::Log
                } else {
                    action
                }
            }
            WafMode::Bypass => ActionType::Allow,
        }
    }
}

impl std::str::FromStr for WafMode {
    type Err = crate::error::WafError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(WafMode::Block),
            "alert" => Ok(WafMode::Alert),
            "bypass" => Ok(WafMode::Bypass),
            other => Err(crate::error::WafError::invalid_params(format!(
                "unknown waf mode: {other}"
            ))),
        }
    }
}

/// Tunables for the engine core.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker tasks the parallel matcher fans out to per check.
    pub workers: usize,
    /// Input length cap applied before the SQLi/XSS detectors run.
    pub max_input_len: usize,
    /// TTL for in-process cache entries, in seconds.
    pub local_cache_ttl_secs: u64,
    /// TTL for shared-cache rule entries, in seconds.
    pub rule_cache_ttl_secs: u64,
    /// TTL for cached IP verdicts, in seconds.
    pub ip_verdict_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_input_len: 4096,
            local_cache_ttl_secs: 300,
            rule_cache_ttl_secs: 24 * 3600,
            ip_verdict_ttl_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_transforms() {
        assert_eq!(WafMode::Block.apply(ActionType::Block), ActionType::Block);
        assert_eq!(WafMode::Alert.apply(ActionType::Block), ActionType::Log);
        assert_eq!(
            WafMode::Alert.apply(ActionType::Redirect),
            ActionType::Redirect
        );
        assert_eq!(WafMode::Bypass.apply(ActionType::Block), ActionType::Allow);
        assert_eq!(
            WafMode::Bypass.apply(ActionType::Captcha),
            ActionType::Allow
        );
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("bypass".parse::<WafMode>().unwrap(), WafMode::Bypass);
        assert!("monitor".parse::<WafMode>().is_err());
    }
}
