//! Regex matcher with a literal-prefix index
//!
//! Patterns are compiled once at add-time. Each pattern contributes its
//! longest literal prefix to a bucket index; at match time the URI's own
//! prefixes select a candidate subset so most rules never run. Patterns with
//! no metacharacters at all skip the regex engine entirely and use substring
//! search.

use parking_lot::RwLock;
use regex::Regex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::error::{WafError, WafResult};
use crate::matcher::Matcher;
use crate::model::{CheckRequest, Rule, RuleMatch};

/// Complexity bounds shielding the engine from pathological patterns.
pub const MAX_PATTERN_LEN: usize = 1000;
pub const MAX_GROUP_DEPTH: usize = 5;
pub const MAX_REPEAT: u32 = 100;

const MIN_PREFIX_LEN: usize = 3;
const MAX_PREFIX_LEN: usize = 10;

/// Reject patterns that exceed the complexity bounds: overall length,
/// parenthesis nesting, and bounded-repetition counts.
pub fn validate_pattern(pattern: &str) -> WafResult<()> {
    if pattern.len() > MAX_PATTERN_LEN {
        return Err(WafError::rule_validation(format!(
            "pattern exceeds {MAX_PATTERN_LEN} bytes"
        )));
    }

    let mut depth = 0usize;
    let mut max_depth = 0usize;
    for ch in pattern.chars() {
        match ch {
            '(' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    if max_depth > MAX_GROUP_DEPTH {
        return Err(WafError::rule_validation(format!(
            "pattern group nesting exceeds {MAX_GROUP_DEPTH}"
        )));
    }

    let bytes = pattern.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(close) = pattern[i..].find('}') {
                let inner = &pattern[i + 1..i + close];
                let count = inner.split(',').next().unwrap_or("");
                if let Ok(n) = count.trim().parse::<u32>() {
                    if n > MAX_REPEAT {
                        return Err(WafError::rule_validation(format!(
                            "pattern repetition exceeds {MAX_REPEAT}"
                        )));
                    }
                }
            }
        }
        i += 1;
    }

    Ok(())
}

fn is_metachar(c: u8) -> bool {
    matches!(
        c,
        b'*' | b'+' | b'?' | b'.' | b'^' | b'$' | b'(' | b')' | b'[' | b']' | b'{' | b'}' | b'|'
            | b'\\'
    )
}

/// Longest literal prefix, suffix, and whether the pattern is pure literal.
/// A leading `^` / trailing `$` anchor is ignored rather than treated as a
/// metacharacter break. Metacharacters are all ASCII, so byte positions are
/// always char boundaries.
fn analyze(pattern: &str) -> (String, String, bool) {
    let head = pattern.strip_prefix('^').unwrap_or(pattern);
    let prefix_end = head
        .bytes()
        .position(is_metachar)
        .unwrap_or(head.len());
    let prefix = head[..prefix_end].to_string();

    let tail = pattern.strip_suffix('$').unwrap_or(pattern);
    let suffix_start = tail
        .bytes()
        .rposition(is_metachar)
        .map(|i| i + 1)
        .unwrap_or(0);
    let suffix = tail[suffix_start..].to_string();

    let literal = !pattern.bytes().any(is_metachar);
    (prefix, suffix, literal)
}

/// Truncate to the index cap without splitting a multibyte char.
fn index_key_of(prefix: &str) -> String {
    let mut end = prefix.len().min(MAX_PREFIX_LEN);
    while !prefix.is_char_boundary(end) {
        end -= 1;
    }
    prefix[..end].to_string()
}

struct RegexRule {
    rule: Rule,
    regex: Regex,
    prefix: String,
    #[allow(dead_code)]
    suffix: String,
    literal: bool,
    /// Key this rule is bucketed under, if the prefix was long enough.
    index_key: Option<String>,
}

#[derive(Default)]
struct Inner {
    rules: FxHashMap<i64, Arc<RegexRule>>,
    prefixes: FxHashMap<String, Vec<Arc<RegexRule>>>,
}

/// Pre-compiled regex matcher over the request URI.
#[derive(Default)]
pub struct RegexMatcher {
    inner: RwLock<Inner>,
}

impl RegexMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn indexed_under(&self, prefix: &str) -> Vec<i64> {
        self.inner
            .read()
            .prefixes
            .get(prefix)
            .map(|rules| rules.iter().map(|r| r.rule.id).collect())
            .unwrap_or_default()
    }
}

impl Matcher for RegexMatcher {
    fn add(&self, rule: &Rule) -> WafResult<()> {
        validate_pattern(&rule.pattern)?;

        let regex = Regex::new(&rule.pattern)
            .map_err(|e| WafError::rule_validation(format!("failed to compile pattern: {e}")))?;
        let (prefix, suffix, literal) = analyze(&rule.pattern);

        let index_key = if prefix.len() >= MIN_PREFIX_LEN {
            Some(index_key_of(&prefix))
        } else {
            None
        };

        let entry = Arc::new(RegexRule {
            rule: rule.clone(),
            regex,
            prefix,
            suffix,
            literal,
            index_key: index_key.clone(),
        });

        let mut inner = self.inner.write();
        inner.rules.insert(rule.id, Arc::clone(&entry));
        if let Some(key) = index_key {
            inner.prefixes.entry(key).or_default().push(entry);
        }
        Ok(())
    }

    fn remove(&self, rule_id: i64) -> WafResult<()> {
        let mut inner = self.inner.write();
        let Some(entry) = inner.rules.remove(&rule_id) else {
            return Err(WafError::rule_not_found(format!("rule not found: {rule_id}")));
        };

        if let Some(key) = &entry.index_key {
            if let Some(bucket) = inner.prefixes.get_mut(key) {
                bucket.retain(|r| r.rule.id != rule_id);
                if bucket.is_empty() {
                    inner.prefixes.remove(key);
                }
            }
        }
        Ok(())
    }

    fn match_request(&self, cancel: &CancelToken, req: &CheckRequest) -> WafResult<Vec<RuleMatch>> {
        cancel.ensure_active()?;

        let inner = self.inner.read();
        let content = req.uri.as_str();
        let mut matches = Vec::with_capacity(16);

        // Candidate filtering: every indexable prefix of the URI selects its
        // bucket; the union is the candidate set.
        let mut candidates: Vec<Arc<RegexRule>> = Vec::new();
        let max = MAX_PREFIX_LEN.min(content.len());
        for len in MIN_PREFIX_LEN..=max {
            let Some(prefix) = content.get(..len) else {
                continue;
            };
            if let Some(bucket) = inner.prefixes.get(prefix) {
                candidates.extend(bucket.iter().cloned());
            }
        }

        // No prefix hit: fall back to scanning every rule.
        if candidates.is_empty() {
            candidates.extend(inner.rules.values().cloned());
        }

        for entry in &candidates {
            cancel.ensure_active()?;

            if entry.literal {
                if let Some(idx) = content.find(&entry.rule.pattern) {
                    matches.push(RuleMatch {
                        rule: entry.rule.clone(),
                        matched_str: entry.rule.pattern.clone(),
                        position: idx,
                        score: 1.0,
                    });
                }
                continue;
            }

            if let Some(m) = entry.regex.find(content) {
                matches.push(RuleMatch {
                    rule: entry.rule.clone(),
                    matched_str: m.as_str().to_string(),
                    position: m.start(),
                    score: 1.0,
                });
            }
        }

        Ok(matches)
    }

    fn clear(&self) -> WafResult<()> {
        *self.inner.write() = Inner::default();
        Ok(())
    }
}
