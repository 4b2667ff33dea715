//! Boolean rule expressions
//!
//! Wraps a set of base matchers and composes their verdicts through
//! AND / OR / NOT / ANY-k / ALL-k combinators. Each rule's `combinator`
//! field selects the top-level shape; a rule without one is evaluated
//! directly against the base matchers.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::error::{WafError, WafResult};
use crate::matcher::Matcher;
use crate::model::{CheckRequest, Rule, RuleCombinator, RuleMatch};

const DEFAULT_THRESHOLD: usize = 1;

#[derive(Clone, Copy, PartialEq, Eq)]
enum ExprKind {
    Rule,
    And,
    Or,
    Not,
    Any,
    All,
}

/// A parsed rule expression tree.
pub struct Expression {
    kind: ExprKind,
    rule: Rule,
    children: Vec<Expression>,
    threshold: usize,
}

impl Expression {
    fn leaf(rule: Rule) -> Self {
        Self {
            kind: ExprKind::Rule,
            rule,
            children: Vec::new(),
            threshold: DEFAULT_THRESHOLD,
        }
    }

    /// Build the expression a rule's combinator describes: the rule itself
    /// becomes the single child of the combinator node.
    fn parse(rule: &Rule) -> Self {
        let Some(combinator) = rule.combinator else {
            return Self::leaf(rule.clone());
        };
        let kind = match combinator {
            RuleCombinator::And => ExprKind::And,
            RuleCombinator::Or => ExprKind::Or,
            RuleCombinator::Not => ExprKind::Not,
            RuleCombinator::Any => ExprKind::Any,
            RuleCombinator::All => ExprKind::All,
        };
        Self {
            kind,
            rule: rule.clone(),
            children: vec![Self::leaf(rule.clone())],
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn rule_id(&self) -> i64 {
        self.rule.id
    }
}

/// Evaluates rule expressions over a set of named base matchers.
pub struct ExpressionMatcher {
    expressions: RwLock<Vec<Expression>>,
    matchers: FxHashMap<String, Arc<dyn Matcher>>,
}

impl ExpressionMatcher {
    pub fn new(matchers: FxHashMap<String, Arc<dyn Matcher>>) -> Self {
        Self {
            expressions: RwLock::new(Vec::new()),
            matchers,
        }
    }

    fn evaluate(
        &self,
        cancel: &CancelToken,
        expr: &Expression,
        req: &CheckRequest,
    ) -> WafResult<(bool, Option<RuleMatch>)> {
        cancel.ensure_active()?;

        match expr.kind {
            ExprKind::Rule => {
                for matcher in self.matchers.values() {
                    let matches = matcher.match_request(cancel, req)?;
                    if let Some(m) = matches.into_iter().find(|m| m.rule.id == expr.rule.id) {
                        return Ok((true, Some(m)));
                    }
                }
                Ok((false, None))
            }

            ExprKind::And => {
                for child in &expr.children {
                    let (matched, _) = self.evaluate(cancel, child, req)?;
                    if !matched {
                        return Ok((false, None));
                    }
                }
                Ok((true, Some(synthetic_match(&expr.rule))))
            }

            ExprKind::Or => {
                for child in &expr.children {
                    let (matched, found) = self.evaluate(cancel, child, req)?;
                    if matched {
                        return Ok((true, found.or_else(|| Some(synthetic_match(&expr.rule)))));
                    }
                }
                Ok((false, None))
            }

            ExprKind::Not => {
                let (matched, _) = self.evaluate(cancel, &expr.children[0], req)?;
                if matched {
                    Ok((false, None))
                } else {
                    Ok((true, Some(synthetic_match(&expr.rule))))
                }
            }

            ExprKind::Any => {
                let mut count = 0;
                for child in &expr.children {
                    let (matched, _) = self.evaluate(cancel, child, req)?;
                    if matched {
                        count += 1;
                        if count >= expr.threshold {
                            return Ok((true, Some(synthetic_match(&expr.rule))));
                        }
                    }
                }
                Ok((false, None))
            }

            ExprKind::All => {
                let mut count = 0;
                for child in &expr.children {
                    let (matched, _) = self.evaluate(cancel, child, req)?;
                    if matched {
                        count += 1;
                    }
                }
                if count >= expr.threshold {
                    Ok((true, Some(synthetic_match(&expr.rule))))
                } else {
                    Ok((false, None))
                }
            }
        }
    }
}

fn synthetic_match(rule: &Rule) -> RuleMatch {
    RuleMatch {
        rule: rule.clone(),
        matched_str: String::new(),
        position: 0,
        score: 1.0,
    }
}

impl Matcher for ExpressionMatcher {
    fn add(&self, rule: &Rule) -> WafResult<()> {
        let expr = Expression::parse(rule);
        self.expressions.write().push(expr);

        for matcher in self.matchers.values() {
            matcher.add(rule)?;
        }
        Ok(())
    }

    fn remove(&self, rule_id: i64) -> WafResult<()> {
        if rule_id <= 0 {
            return Err(WafError::rule_match("invalid rule id"));
        }

        {
            let mut expressions = self.expressions.write();
            let before = expressions.len();
            expressions.retain(|e| e.rule_id() != rule_id);
            if expressions.len() == before {
                return Err(WafError::rule_not_found(format!(
                    "rule not found: {rule_id}"
                )));
            }
        }

        for matcher in self.matchers.values() {
            matcher.remove(rule_id)?;
        }
        Ok(())
    }

    /// At most one match per expression, in insertion order.
    fn match_request(&self, cancel: &CancelToken, req: &CheckRequest) -> WafResult<Vec<RuleMatch>> {
        cancel.ensure_active()?;
        if req.uri.is_empty() {
            return Err(WafError::rule_match("request uri must not be empty"));
        }

        let expressions = self.expressions.read();
        let mut matches = Vec::new();
        for expr in expressions.iter() {
            let (matched, found) = self.evaluate(cancel, expr, req)?;
            if matched {
                if let Some(m) = found {
                    matches.push(m);
                }
            }
        }
        Ok(matches)
    }

    fn clear(&self) -> WafResult<()> {
        self.expressions.write().clear();
        for matcher in self.matchers.values() {
            matcher.clear()?;
        }
        Ok(())
    }
}
