//! Matcher pipeline
//!
//! Base matchers share one interface: add/remove rules, match a request,
//! clear. Each guards its derived index with a reader/writer lock so `match`
//! runs concurrently with itself and serially with mutations. The parallel
//! matcher fans a request out to every base matcher; the expression matcher
//! composes base matches through boolean combinators.

pub mod ac;
pub mod expression;
pub mod parallel;
pub mod regex;
pub mod trie;

use crate::cancel::CancelToken;
use crate::error::WafResult;
use crate::model::{CheckRequest, Rule, RuleMatch};

/// A rule matcher over request content.
pub trait Matcher: Send + Sync {
    /// Index a rule. Matchers that do not handle the rule's variable accept
    /// and ignore it.
    fn add(&self, rule: &Rule) -> WafResult<()>;

    /// Drop a rule from the index. Unknown ids fail with a rule-not-found
    /// class error.
    fn remove(&self, rule_id: i64) -> WafResult<()>;

    /// Evaluate the request, returning zero or more matches.
    fn match_request(&self, cancel: &CancelToken, req: &CheckRequest) -> WafResult<Vec<RuleMatch>>;

    /// Drop every indexed rule.
    fn clear(&self) -> WafResult<()>;
}

pub use ac::AcMatcher;
pub use expression::{Expression, ExpressionMatcher};
pub use parallel::ParallelMatcher;
pub use regex::RegexMatcher;
pub use trie::TrieMatcher;
