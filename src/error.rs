//! Error taxonomy
//!
//! Every error carries a stable numeric code grouped by category: system
//! (1000), request (2000), rule (3000), cache (4000), security (5000).
//! Callers branch on the code class rather than on message text.

use thiserror::Error;

/// Stable numeric error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    // System errors (1000-1999)
    Init = 1000,
    Config = 1001,
    Runtime = 1002,
    System = 1003,
    Validation = 1004,

    // Request errors (2000-2999)
    InvalidRequest = 2000,
    MethodNotAllowed = 2001,
    RequestTooLarge = 2002,
    InvalidParams = 2003,
    RateLimit = 2004,

    // Rule errors (3000-3999)
    RuleEngine = 3000,
    RuleSync = 3001,
    RuleCheck = 3002,
    RuleMatch = 3003,
    RuleValidation = 3004,
    RuleNotFound = 3005,
    RuleConflict = 3006,

    // Cache errors (4000-4999)
    Cache = 4000,
    CacheMiss = 4001,
    CacheExpired = 4002,
    CacheInvalid = 4003,

    // Security errors (5000-5999)
    Security = 5000,
    IpBlocked = 5001,
    CcAttack = 5002,
    XssAttack = 5003,
    SqlInjection = 5004,
    AuthFailed = 5005,
    PermDenied = 5006,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as i32)
    }
}

/// Engine error: a code plus a human-readable message.
#[derive(Debug, Clone, Error)]
#[error("[{code}] {message}")]
pub struct WafError {
    code: ErrorCode,
    message: String,
}

pub type WafResult<T> = Result<T, WafError>;

impl WafError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn rule_engine(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RuleEngine, message)
    }

    pub fn rule_match(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RuleMatch, message)
    }

    pub fn rule_validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RuleValidation, message)
    }

    pub fn rule_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RuleNotFound, message)
    }

    pub fn rule_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RuleConflict, message)
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cache, message)
    }

    pub fn cache_miss(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CacheMiss, message)
    }

    pub fn cache_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CacheInvalid, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::System, message)
    }

    pub fn sql_injection(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SqlInjection, message)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::Validation | ErrorCode::InvalidParams | ErrorCode::RuleValidation
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::RuleNotFound
    }

    pub fn is_cache(&self) -> bool {
        (self.code as i32) >= 4000 && (self.code as i32) < 5000
    }

    pub fn is_cache_miss(&self) -> bool {
        self.code == ErrorCode::CacheMiss
    }

    pub fn is_security(&self) -> bool {
        (self.code as i32) >= 5000 && (self.code as i32) < 6000
    }

    /// Whether the operation that produced this error is worth retrying.
    pub fn should_retry(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::RuleSync
                | ErrorCode::Cache
                | ErrorCode::CacheMiss
                | ErrorCode::RuleEngine
                | ErrorCode::System
        )
    }
}
