//! Aho-Corasick multi-pattern matcher
//!
//! Literal substring matching over the request URI for many patterns in a
//! single scan. Nodes live in an arena and link to each other by index, so
//! failure links never form owning cycles. Failure links are rebuilt with a
//! BFS after every insert; `remove` rebuilds the whole automaton from the
//! surviving rules, which is acceptable because removes are rare next to
//! matches.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

use crate::cancel::CancelToken;
use crate::error::{WafError, WafResult};
use crate::matcher::Matcher;
use crate::model::{CheckRequest, Rule, RuleMatch};

/// Runes scanned between cancellation checks.
const CHECK_INTERVAL: usize = 1000;

const ROOT: usize = 0;

struct AcNode {
    children: FxHashMap<char, usize>,
    fail: usize,
    depth: usize,
    is_end: bool,
    rules: Vec<Rule>,
}

impl AcNode {
    fn new(depth: usize) -> Self {
        Self {
            children: FxHashMap::default(),
            fail: ROOT,
            depth,
            is_end: false,
            rules: Vec::new(),
        }
    }
}

#[derive(Default)]
struct AcInner {
    nodes: Vec<AcNode>,
    /// Source of truth for rebuilds: rule id to rule.
    rules: FxHashMap<i64, Rule>,
}

impl AcInner {
    fn new() -> Self {
        Self {
            nodes: vec![AcNode::new(0)],
            rules: FxHashMap::default(),
        }
    }

    fn insert(&mut self, rule: &Rule) {
        let mut current = ROOT;
        for ch in rule.pattern.chars() {
            let next = match self.nodes[current].children.get(&ch) {
                Some(&idx) => idx,
                None => {
                    let depth = self.nodes[current].depth + 1;
                    self.nodes.push(AcNode::new(depth));
                    let idx = self.nodes.len() - 1;
                    self.nodes[current].children.insert(ch, idx);
                    idx
                }
            };
            current = next;
        }
        self.nodes[current].is_end = true;
        self.nodes[current].rules.push(rule.clone());
    }

    /// BFS over the trie wiring each node's failure link to its longest
    /// proper suffix present in the trie.
    fn build_fail_links(&mut self) {
        let mut queue = VecDeque::new();

        let first_level: Vec<usize> = self.nodes[ROOT].children.values().copied().collect();
        for idx in first_level {
            self.nodes[idx].fail = ROOT;
            queue.push_back(idx);
        }

        while let Some(current) = queue.pop_front() {
            let children: Vec<(char, usize)> = self.nodes[current]
                .children
                .iter()
                .map(|(&ch, &idx)| (ch, idx))
                .collect();

            for (ch, child) in children {
                queue.push_back(child);

                let mut fail = self.nodes[current].fail;
                loop {
                    if let Some(&next) = self.nodes[fail].children.get(&ch) {
                        if next != child {
                            self.nodes[child].fail = next;
                        }
                        break;
                    }
                    if fail == ROOT {
                        self.nodes[child].fail = ROOT;
                        break;
                    }
                    fail = self.nodes[fail].fail;
                }
            }
        }
    }

    fn rebuild(&mut self) {
        self.nodes = vec![AcNode::new(0)];
        let rules: Vec<Rule> = self.rules.values().cloned().collect();
        for rule in &rules {
            self.insert(rule);
        }
        self.build_fail_links();
    }
}

/// Multi-pattern literal matcher over the request URI.
pub struct AcMatcher {
    inner: RwLock<AcInner>,
}

impl Default for AcMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl AcMatcher {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(AcInner::new()),
        }
    }
}

impl Matcher for AcMatcher {
    fn add(&self, rule: &Rule) -> WafResult<()> {
        if rule.pattern.is_empty() {
            return Err(WafError::rule_match("rule pattern must not be empty"));
        }

        let mut inner = self.inner.write();
        inner.rules.insert(rule.id, rule.clone());
        inner.insert(rule);
        inner.build_fail_links();
        Ok(())
    }

    fn remove(&self, rule_id: i64) -> WafResult<()> {
        let mut inner = self.inner.write();
        if inner.rules.remove(&rule_id).is_none() {
            return Err(WafError::rule_not_found(format!("rule not found: {rule_id}")));
        }
        inner.rebuild();
        Ok(())
    }

    fn match_request(&self, cancel: &CancelToken, req: &CheckRequest) -> WafResult<Vec<RuleMatch>> {
        cancel.ensure_active()?;

        let inner = self.inner.read();
        let content = req.uri.as_str();
        let mut matches = Vec::with_capacity(16);
        let mut current = ROOT;

        // Byte offset of every consumed rune, for slicing matched substrings.
        let mut offsets = Vec::with_capacity(content.len());
        let mut scanned = 0usize;

        for (byte_idx, ch) in content.char_indices() {
            scanned += 1;
            if scanned >= CHECK_INTERVAL {
                cancel.ensure_active()?;
                scanned = 0;
            }
            offsets.push(byte_idx);

            // Follow failure links until a child for this rune exists.
            while current != ROOT && !inner.nodes[current].children.contains_key(&ch) {
                current = inner.nodes[current].fail;
            }
            current = match inner.nodes[current].children.get(&ch) {
                Some(&next) => next,
                None => continue,
            };

            // Every terminal on the suffix-fail chain is a match ending here.
            let mut node = current;
            loop {
                let n = &inner.nodes[node];
                if n.is_end {
                    let start_rune = offsets.len() - n.depth;
                    let start = offsets[start_rune];
                    let end = byte_idx + ch.len_utf8();
                    for rule in &n.rules {
                        matches.push(RuleMatch {
                            rule: rule.clone(),
                            matched_str: content[start..end].to_string(),
                            position: start,
                            score: 1.0,
                        });
                    }
                }
                if node == ROOT {
                    break;
                }
                node = n.fail;
            }
        }

        Ok(matches)
    }

    fn clear(&self) -> WafResult<()> {
        *self.inner.write() = AcInner::new();
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

    fn run(matcher: &AcMatcher, uri: &str) -> Vec<RuleMatch> {
        matcher.match_request(&CancelToken::new(), &req(uri)).unwrap()
    }

    #[test]
    fn test_single_pattern_substring() {
        let matcher = AcMatcher::new();
        matcher.add(&test_rule(1, "admin", "admin")).unwrap();

        let matches = run(&matcher, "/site/admin/login");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule.id, 1);
        assert_eq!(matches[0].matched_str, "admin");
        assert_eq!(matches[0].position, 6);
        assert_eq!(matches[0].score, 1.0);
    }

    #[test]
    fn test_overlapping_patterns_via_fail_links() {
        let matcher = AcMatcher::new();
        matcher.add(&test_rule(1, "he", "he")).unwrap();
        matcher.add(&test_rule(2, "she", "she")).unwrap();
        matcher.add(&test_rule(3, "hers", "hers")).unwrap();

        let matches = run(&matcher, "ushers");
        let mut ids: Vec<i64> = matches.iter().map(|m| m.rule.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_repeated_occurrences() {
        let matcher = AcMatcher::new();
        matcher.add(&test_rule(1, "ab", "ab")).unwrap();

        let matches = run(&matcher, "ab-ab");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].position, 0);
        assert_eq!(matches[1].position, 3);
    }

    #[test]
    fn test_multibyte_input() {
        let matcher = AcMatcher::new();
        matcher.add(&test_rule(1, "jp", "日本")).unwrap();

        let matches = run(&matcher, "/path/日本/x");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].matched_str, "日本");
    }

    #[test]
    fn test_remove_rebuilds_survivors() {
        let matcher = AcMatcher::new();
        matcher.add(&test_rule(1, "a", "abc")).unwrap();
        matcher.add(&test_rule(2, "b", "bcd")).unwrap();

        matcher.remove(1).unwrap();
        let matches = run(&matcher, "abcd");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule.id, 2);

        assert!(matcher.remove(99).unwrap_err().is_not_found());
    }

    #[test]
    fn test_clear() {
        let matcher = AcMatcher::new();
        matcher.add(&test_rule(1, "a", "abc")).unwrap();
        matcher.clear().unwrap();
        assert!(run(&matcher, "abc").is_empty());
    }

    #[test]
    fn test_cancellation_before_scan() {
        let matcher = AcMatcher::new();
        matcher.add(&test_rule(1, "a", "abc")).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matcher.match_request(&cancel, &req("abc")).is_err());
    }
}
