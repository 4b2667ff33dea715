//! Path-segment trie for URL rules
//!
//! Patterns and request URIs are split on `/` with surrounding slashes
//! stripped. `*` matches exactly one segment. A terminal node reached at any
//! depth emits its rules, so `/admin` also fires on `/admin/login`.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::cancel::CancelToken;
use crate::error::{WafError, WafResult};
use crate::matcher::Matcher;
use crate::model::{CheckRequest, Rule, RuleMatch, RuleVariable};

#[derive(Default)]
struct TrieNode {
    children: FxHashMap<String, TrieNode>,
    rules: Vec<Rule>,
    is_end: bool,
}

impl TrieNode {
    /// Prune `rule_id` from this subtree. Returns true once removed.
    fn remove(&mut self, rule_id: i64) -> bool {
        if let Some(idx) = self.rules.iter().position(|r| r.id == rule_id) {
            self.rules.remove(idx);
            if self.rules.is_empty() {
                self.is_end = false;
            }
            return true;
        }
        self.children.values_mut().any(|child| child.remove(rule_id))
    }

    fn collect(&self, parts: &[&str], depth: usize, uri: &str, matches: &mut Vec<RuleMatch>) {
        if self.is_end {
            for rule in &self.rules {
                matches.push(RuleMatch {
                    rule: rule.clone(),
                    matched_str: uri.to_string(),
                    position: 0,
                    score: 1.0,
                });
            }
        }

        if depth >= parts.len() {
            return;
        }

        if let Some(child) = self.children.get(parts[depth]) {
            child.collect(parts, depth + 1, uri, matches);
        }
        if let Some(child) = self.children.get("*") {
            child.collect(parts, depth + 1, uri, matches);
        }
    }
}

/// URL matcher over `request_uri` rules.
#[derive(Default)]
pub struct TrieMatcher {
    root: RwLock<TrieNode>,
}

impl TrieMatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

fn split_segments(path: &str) -> Vec<&str> {
    path.trim_matches('/').split('/').collect()
}

impl Matcher for TrieMatcher {
    fn add(&self, rule: &Rule) -> WafResult<()> {
        // Only URL rules live in the trie.
        if rule.variable != RuleVariable::RequestUri {
            return Ok(());
        }
        if rule.pattern.is_empty() {
            return Err(WafError::rule_match("rule pattern must not be empty"));
        }

        let mut root = self.root.write();
        let mut node = &mut *root;
        for part in split_segments(&rule.pattern) {
            node = node.children.entry(part.to_string()).or_default();
        }
        node.is_end = true;
        node.rules.push(rule.clone());
        Ok(())
    }

    fn remove(&self, rule_id: i64) -> WafResult<()> {
        if rule_id <= 0 {
            return Err(WafError::rule_match("invalid rule id"));
        }

        let mut root = self.root.write();
        if root.remove(rule_id) {
            Ok(())
        } else {
            Err(WafError::rule_not_found(format!("rule not found: {rule_id}")))
        }
    }

    fn match_request(&self, cancel: &CancelToken, req: &CheckRequest) -> WafResult<Vec<RuleMatch>> {
        cancel.ensure_active()?;
        if req.uri.is_empty() {
            return Err(WafError::rule_match("request uri must not be empty"));
        }

        let root = self.root.read();
        let parts = split_segments(&req.uri);
        let mut matches = Vec::new();
        root.collect(&parts, 0, &req.uri, &mut matches);
        Ok(matches)
    }

    fn clear(&self) -> WafResult<()> {
        *self.root.write() = TrieNode::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::rule::test_rule;

    fn req(uri: &str) -> CheckRequest {
        CheckRequest {
            client_ip: "1.2.3.4".into(),
            uri: uri.into(),
            method: "GET".into(),
            ..Default::default()
        }
    }

    fn matched_ids(matcher: &TrieMatcher, uri: &str) -> Vec<i64> {
        let cancel = CancelToken::new();
        matcher
            .match_request(&cancel, &req(uri))
            .unwrap()
            .into_iter()
            .map(|m| m.rule.id)
            .collect()
    }

    #[test]
    fn test_exact_path_match() {
        let matcher = TrieMatcher::new();
        matcher.add(&test_rule(1, "admin", "/admin/login")).unwrap();

        assert_eq!(matched_ids(&matcher, "/admin/login"), vec![1]);
        assert!(matched_ids(&matcher, "/admin/logout").is_empty());
        assert!(matched_ids(&matcher, "/public").is_empty());
    }

    #[test]
    fn test_wildcard_matches_exactly_one_segment() {
        let matcher = TrieMatcher::new();
        matcher.add(&test_rule(1, "admin-any", "/admin/*")).unwrap();

        assert_eq!(matched_ids(&matcher, "/admin/login"), vec![1]);
        assert_eq!(matched_ids(&matcher, "/admin/users"), vec![1]);
        assert!(matched_ids(&matcher, "/admin").is_empty());
    }

    #[test]
    fn test_terminal_prefix_fires_on_longer_uri() {
        let matcher = TrieMatcher::new();
        matcher.add(&test_rule(1, "admin", "/admin")).unwrap();

        assert_eq!(matched_ids(&matcher, "/admin"), vec![1]);
        assert_eq!(matched_ids(&matcher, "/admin/login"), vec![1]);
    }

    #[test]
    fn test_non_uri_rules_are_ignored() {
        let matcher = TrieMatcher::new();
        let mut rule = test_rule(1, "body-rule", "/x");
        rule.variable = RuleVariable::RequestBody;
        matcher.add(&rule).unwrap();

        assert!(matched_ids(&matcher, "/x").is_empty());
    }

    #[test]
    fn test_remove_prunes_everywhere() {
        let matcher = TrieMatcher::new();
        matcher.add(&test_rule(1, "a", "/admin/*")).unwrap();
        matcher.add(&test_rule(2, "b", "/admin/*")).unwrap();

        matcher.remove(1).unwrap();
        assert_eq!(matched_ids(&matcher, "/admin/login"), vec![2]);

        matcher.remove(2).unwrap();
        assert!(matched_ids(&matcher, "/admin/login").is_empty());

        let err = matcher.remove(2).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_clear_resets_root() {
        let matcher = TrieMatcher::new();
        matcher.add(&test_rule(1, "a", "/admin")).unwrap();
        matcher.clear().unwrap();
        assert!(matched_ids(&matcher, "/admin").is_empty());
    }

    #[test]
    fn test_cancelled_token_aborts() {
        let matcher = TrieMatcher::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matcher.match_request(&cancel, &req("/x")).is_err());
    }
}
