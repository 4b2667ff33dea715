//! WAF rule engine
//!
//! The core of a web-application-firewall rule service: given an inbound
//! request description, decide whether to allow, block, log, redirect, or
//! challenge it by evaluating a live, versioned rule set.
//!
//! Three subsystems carry the weight:
//!
//! - The **matcher pipeline** ([`matcher`]): trie, Aho-Corasick, and
//!   regex base matchers fanned out in parallel, composed through boolean
//!   expressions, with results ordered by rule priority.
//! - The **CC core** ([`service::CcService`]): sliding-window per-URI rate
//!   limiting over the shared key-value store, plus an atomic per-client
//!   counter path inside the check handlers.
//! - The **rule lifecycle** ([`service::RuleEngine`]): versioned CRUD with
//!   an append-only version log, a two-tier cache with coherent
//!   invalidation, synchronous reload, and rollback to historical versions.
//!
//! Storage is abstracted behind the [`storage`] traits; in-memory
//! implementations back the test suite and single-node embedding.
//!
//! ```no_run
//! use waf_engine::{CancelToken, CheckRequest, RuleEngine};
//!
//! # async fn demo() -> waf_engine::WafResult<()> {
//! let engine = RuleEngine::in_memory();
//! let verdict = engine
//!     .check(
//!         &CancelToken::new(),
//!         &CheckRequest {
//!             client_ip: "203.0.113.7".into(),
//!             uri: "/admin/login".into(),
//!             method: "GET".into(),
//!             ..Default::default()
//!         },
//!     )
//!     .await?;
//! # let _ = verdict;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod matcher;
pub mod model;
pub mod service;
pub mod sqli;
pub mod storage;
pub mod validator;
pub mod xss;

pub use cancel::CancelToken;
pub use config::{EngineConfig, WafMode};
pub use error::{ErrorCode, WafError, WafResult};
pub use model::{
    ActionType, CcRule, CheckRequest, CheckResult, IpRule, Rule, RuleMatch, RuleQuery, RuleStatus,
    RuleType, RuleVariable, Severity,
};
pub use service::{CcService, IpService, RuleEngine, VersionService};
