//! Cooperative cancellation
//!
//! Every match and check entry point accepts a [`CancelToken`]; bounded scan
//! loops poll it at a fixed interval and abort mid-scan when it fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{WafError, WafResult};

/// Clonable cancellation flag shared between a caller and the subsystems it
/// invokes. Cancelling is one-way: a fired token never resets.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    fired: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.fired.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Returns a rule-match error if the token has fired.
    pub fn ensure_active(&self) -> WafResult<()> {
        if self.is_cancelled() {
            Err(WafError::rule_match("operation cancelled"))
        } else {
            Ok(())
        }
    }
}
