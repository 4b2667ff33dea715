//! XSS detection
//!
//! A fixed pattern set scanned against the configured request variable. Any
//! hit is a positive; there is no scoring.

use regex::Regex;
use std::sync::LazyLock;

static XSS_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Script tags, with or without a closing tag.
        r"(?i)<script[^>]*>",
        // Event-handler, style, or javascript attributes on any tag.
        r"(?i)<[^>]*\b(on\w+|style|javascript:)",
        // Dangerous URL schemes.
        r"(?i)(javascript|vbscript|expression|data):\s*",
        // Dangerous embedding tags.
        r"(?i)<(iframe|object|embed|applet)",
        // Attribute injection via src/href/data.
        r"(?i)<\w+[^>]*\s+src\s*=",
        r"(?i)<\w+[^>]*\s+href\s*=",
        r"(?i)<\w+[^>]*\s+data\s*=",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("xss pattern must compile"))
    .collect()
});

/// Whether the input matches any pattern in the fixed set.
pub fn contains_xss(input: &str) -> bool {
    XSS_PATTERNS.iter().any(|re| re.is_match(input))
}
