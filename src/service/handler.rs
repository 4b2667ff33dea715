//! Per-type rule handlers
//!
//! Rule handlers form a small closed set, so dispatch is a match on the rule
//! type rather than an open registry. Compiled regexes are cached per rule id
//! in concurrent maps; a rare double-compile on racing inserts is harmless.

use dashmap::DashMap;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{WafError, WafResult};
use crate::model::{CheckRequest, Rule, RuleType, RuleVariable};
use crate::sqli::SqliDetector;
use crate::storage::KvStore;
use crate::validator::InputValidator;
use crate::xss::contains_xss;

/// Parameters of a CC rule, carried in the rule's opaque `params` field.
#[derive(Debug, Deserialize)]
struct CcParams {
    /// Window length in seconds.
    window: i64,
    /// Requests allowed per client within the window.
    #[serde(alias = "maxReqs")]
    max_reqs: i64,
}

/// Evaluates a single rule against a request, dispatched on rule type.
pub struct HandlerSet {
    kv: Arc<dyn KvStore>,
    ip_regex_cache: DashMap<i64, Regex>,
    regex_cache: DashMap<i64, Regex>,
    sqli: SqliDetector,
    validator: InputValidator,
}

impl HandlerSet {
    pub fn new(kv: Arc<dyn KvStore>, validator: InputValidator) -> Self {
        Self {
            kv,
            ip_regex_cache: DashMap::new(),
            regex_cache: DashMap::new(),
            sqli: SqliDetector::new(),
            validator,
        }
    }

    /// Drop cached compiled patterns for a rule after it changes.
    pub fn invalidate(&self, rule_id: i64) {
        self.ip_regex_cache.remove(&rule_id);
        self.regex_cache.remove(&rule_id);
    }

    pub async fn match_rule(
        &self,
        cancel: &CancelToken,
        rule: &Rule,
        req: &CheckRequest,
    ) -> WafResult<bool> {
        cancel.ensure_active()?;

        match rule.rule_type {
            RuleType::Ip => self.match_ip(rule, req),
            RuleType::Cc => self.match_cc(cancel, rule, req).await,
            RuleType::Regex => self.match_regex(rule, req),
            RuleType::Sqli => self.match_sqli(rule, req),
            RuleType::Xss => self.match_xss(rule, req),
            RuleType::Custom => Err(WafError::rule_engine(format!(
                "unsupported rule type: {}",
                rule.rule_type
            ))),
        }
    }

    fn compiled(cache: &DashMap<i64, Regex>, rule: &Rule) -> WafResult<Regex> {
        if let Some(re) = cache.get(&rule.id) {
            return Ok(re.clone());
        }
        let re = Regex::new(&rule.pattern)
            .map_err(|e| WafError::rule_engine(format!("failed to compile pattern: {e}")))?;
        cache.insert(rule.id, re.clone());
        Ok(re)
    }

    fn match_ip(&self, rule: &Rule, req: &CheckRequest) -> WafResult<bool> {
        let re = Self::compiled(&self.ip_regex_cache, rule)?;
        Ok(re.is_match(&req.client_ip))
    }

    async fn match_cc(
        &self,
        cancel: &CancelToken,
        rule: &Rule,
        req: &CheckRequest,
    ) -> WafResult<bool> {
        let params: CcParams = serde_json::from_value(rule.params.clone())
            .map_err(|e| WafError::rule_engine(format!("invalid cc rule params: {e}")))?;
        if params.window <= 0 || params.max_reqs <= 0 {
            return Err(WafError::rule_engine(format!(
                "invalid cc rule params: window={}, max_reqs={}",
                params.window, params.max_reqs
            )));
        }

        // One atomic increment-and-expire per request.
        cancel.ensure_active()?;
        let key = format!("cc:{}:{}", rule.id, req.client_ip);
        let count = self
            .kv
            .incr_with_expire(&key, Duration::from_secs(params.window as u64))
            .await?;

        if count > params.max_reqs {
            debug!(rule_id = rule.id, client_ip = %req.client_ip, count, "cc limit exceeded");
            return Ok(true);
        }
        Ok(false)
    }

    fn match_regex(&self, rule: &Rule, req: &CheckRequest) -> WafResult<bool> {
        let re = Self::compiled(&self.regex_cache, rule)?;
        match rule.variable {
            RuleVariable::RequestUri => Ok(re.is_match(&req.uri)),
            RuleVariable::RequestHeaders => Ok(req.headers.values().any(|v| re.is_match(v))),
            RuleVariable::RequestArgs => Ok(req.args.values().any(|v| re.is_match(v))),
            RuleVariable::RequestBody => Ok(re.is_match(&req.body)),
            RuleVariable::RequestMethod => Ok(re.is_match(&req.method)),
            RuleVariable::Response => Err(WafError::rule_engine(
                "response inspection is not available at check time",
            )),
        }
    }

    fn match_sqli(&self, rule: &Rule, req: &CheckRequest) -> WafResult<bool> {
        match rule.variable {
            RuleVariable::RequestUri => self.detect_sqli(&req.uri),
            RuleVariable::RequestArgs => {
                for value in req.args.values() {
                    if self.detect_sqli(value)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            RuleVariable::RequestBody => self.detect_sqli(&req.body),
            other => Err(WafError::rule_engine(format!(
                "unsupported variable for sqli rule: {other:?}"
            ))),
        }
    }

    fn detect_sqli(&self, input: &str) -> WafResult<bool> {
        // Empty inputs cannot carry an injection; the detector itself treats
        // them as invalid.
        if input.is_empty() {
            return Ok(false);
        }
        let verdict = self.sqli.detect(self.validator.clamp(input))?;
        Ok(verdict.injected)
    }

    fn match_xss(&self, rule: &Rule, req: &CheckRequest) -> WafResult<bool> {
        match rule.variable {
            RuleVariable::RequestUri => Ok(contains_xss(self.validator.clamp(&req.uri))),
            RuleVariable::RequestArgs => Ok(req
                .args
                .values()
                .any(|v| contains_xss(self.validator.clamp(v)))),
            RuleVariable::RequestBody => Ok(contains_xss(self.validator.clamp(&req.body))),
            other => Err(WafError::rule_engine(format!(
                "unsupported variable for xss rule: {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::rule::test_rule;
    use crate::storage::memory::MemoryKv;

    fn handlers() -> HandlerSet {
        HandlerSet::new(Arc::new(MemoryKv::new()), InputValidator::default())
    }

    fn req() -> CheckRequest {
        CheckRequest {
            client_ip: "1.2.3.4".into(),
            uri: "/search".into(),
            method: "GET".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ip_handler_matches_client_ip() {
        let hs = handlers();
        let mut rule = test_rule(1, "ip", r"^1\.2\.3\.\d+$");
        rule.rule_type = RuleType::Ip;

        let cancel = CancelToken::new();
        assert!(hs.match_rule(&cancel, &rule, &req()).await.unwrap());

        let mut other = req();
        other.client_ip = "8.8.8.8".into();
        assert!(!hs.match_rule(&cancel, &rule, &other).await.unwrap());
    }

    #[tokio::test]
    async fn test_cc_handler_counts_per_client() {
        let hs = handlers();
        let mut rule = test_rule(1, "cc", "cc");
        rule.rule_type = RuleType::Cc;
        rule.params = serde_json::json!({"window": 60, "max_reqs": 2});

        let cancel = CancelToken::new();
        let r = req();
        assert!(!hs.match_rule(&cancel, &rule, &r).await.unwrap());
        assert!(!hs.match_rule(&cancel, &rule, &r).await.unwrap());
        assert!(hs.match_rule(&cancel, &rule, &r).await.unwrap());

        // A different client has its own counter.
        let mut other = req();
        other.client_ip = "5.6.7.8".into();
        assert!(!hs.match_rule(&cancel, &rule, &other).await.unwrap());
    }

    #[tokio::test]
    async fn test_cc_handler_rejects_bad_params() {
        let hs = handlers();
        let mut rule = test_rule(1, "cc", "cc");
        rule.rule_type = RuleType::Cc;
        rule.params = serde_json::json!({"window": 0, "max_reqs": 5});

        let err = hs
            .match_rule(&CancelToken::new(), &rule, &req())
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::RuleEngine);
    }

    #[tokio::test]
    async fn test_regex_handler_variable_dispatch() {
        let hs = handlers();
        let cancel = CancelToken::new();

        let mut uri_rule = test_rule(1, "uri", "^/admin");
        uri_rule.variable = RuleVariable::RequestUri;
        let mut r = req();
        r.uri = "/admin/x".into();
        assert!(hs.match_rule(&cancel, &uri_rule, &r).await.unwrap());

        let mut header_rule = test_rule(2, "hdr", "curl");
        header_rule.variable = RuleVariable::RequestHeaders;
        let mut r = req();
        r.headers.insert("User-Agent".into(), "curl/8.0".into());
        assert!(hs.match_rule(&cancel, &header_rule, &r).await.unwrap());

        let mut arg_rule = test_rule(3, "arg", "drop");
        arg_rule.variable = RuleVariable::RequestArgs;
        let mut r = req();
        r.args.insert("q".into(), "drop table".into());
        assert!(hs.match_rule(&cancel, &arg_rule, &r).await.unwrap());
    }

    #[tokio::test]
    async fn test_sqli_handler_on_body() {
        let hs = handlers();
        let mut rule = test_rule(1, "sqli", "sqli");
        rule.rule_type = RuleType::Sqli;
        rule.variable = RuleVariable::RequestBody;

        let mut r = req();
        r.body = "1 UNION SELECT 1,2--".into();
        assert!(hs.match_rule(&CancelToken::new(), &rule, &r).await.unwrap());

        // An empty body is simply not an injection.
        let r = req();
        assert!(!hs.match_rule(&CancelToken::new(), &rule, &r).await.unwrap());
    }

    #[tokio::test]
    async fn test_xss_handler_on_args() {
        let hs = handlers();
        let mut rule = test_rule(1, "xss", "xss");
        rule.rule_type = RuleType::Xss;
        rule.variable = RuleVariable::RequestArgs;

        let mut r = req();
        r.args.insert("q".into(), "<script>alert(1)</script>".into());
        assert!(hs.match_rule(&CancelToken::new(), &rule, &r).await.unwrap());
    }

    #[tokio::test]
    async fn test_custom_type_is_unsupported() {
        let hs = handlers();
        let mut rule = test_rule(1, "custom", "x");
        rule.rule_type = RuleType::Custom;

        let err = hs
            .match_rule(&CancelToken::new(), &rule, &req())
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::RuleEngine);
    }

    #[tokio::test]
    async fn test_invalidate_drops_compiled_pattern() {
        let hs = handlers();
        let mut rule = test_rule(1, "re", "^/old");
        rule.variable = RuleVariable::RequestUri;

        let mut r = req();
        r.uri = "/old/x".into();
        assert!(hs.match_rule(&CancelToken::new(), &rule, &r).await.unwrap());

        // Same id, new pattern: stale cache entry would keep matching /old.
        hs.invalidate(1);
        rule.pattern = "^/new".to_string();
        assert!(!hs.match_rule(&CancelToken::new(), &rule, &r).await.unwrap());
    }
}
