//! Input length guard for the content detectors.

use crate::error::{WafError, WafResult};

pub const DEFAULT_MAX_INPUT_LEN: usize = 4096;

/// Caps the amount of text the SQLi/XSS detectors will scan. Oversized
/// inputs are either rejected (`validate`) or clamped (`clamp`) depending on
/// the call site.
#[derive(Debug, Clone)]
pub struct InputValidator {
    max_len: usize,
}

impl Default for InputValidator {
    fn default() -> Self {
        Self {
            max_len: DEFAULT_MAX_INPUT_LEN,
        }
    }
}

impl InputValidator {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn validate<'a>(&self, input: &'a str) -> WafResult<&'a str> {
        if input.len() > self.max_len {
            return Err(WafError::validation(format!(
                "input length {} exceeds limit {}",
                input.len(),
                self.max_len
            )));
        }
        Ok(input)
    }

    /// Truncate to the cap on a char boundary.
    pub fn clamp<'a>(&self, input: &'a str) -> &'a str {
        if input.len() <= self.max_len {
            return input;
        }
        let mut end = self.max_len;
        while end > 0 && !input.is_char_boundary(end) {
            end -= 1;
        }
        &input[..end]
    }
}
