//! SQL injection detection
//!
//! Two phases: a hand-written SQL lexer produces a token stream, then a small
//! set of weighted heuristics scores it. A cumulative score of
//! [`INJECTION_THRESHOLD`] or more is an injection positive.

use crate::error::{WafError, WafResult};

pub const INJECTION_THRESHOLD: u32 = 3;

const WEIGHT_UNION_SELECT: u32 = 3;
const WEIGHT_ALWAYS_TRUE: u32 = 2;
const WEIGHT_COMMENT_TRUNCATION: u32 = 2;

/// Keywords the lexer distinguishes from plain identifiers.
const SQL_KEYWORDS: &[&str] = &[
    "select", "union", "insert", "update", "delete", "drop", "from", "where",
    "and", "or", "not", "order", "by", "group", "having", "limit", "join",
    "into", "values", "table", "database", "exec", "declare", "cast",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlTokenKind {
    Error,
    Eof,
    Keyword,
    Identifier,
    String,
    Number,
    Operator,
    Comment,
}

#[derive(Debug, Clone)]
pub struct SqlToken {
    pub kind: SqlTokenKind,
    pub value: String,
    pub pos: usize,
}

/// Byte-oriented SQL lexer. Strings honor single and double quotes with
/// backslash escapes; `-- ...` line comments and `/* ... */` block comments
/// are single tokens; whitespace is skipped.
pub struct SqlLexer<'a> {
    input: &'a [u8],
    pos: usize,
    start: usize,
}

impl<'a> SqlLexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
            start: 0,
        }
    }

    pub fn next_token(&mut self) -> SqlToken {
        self.skip_whitespace();
        self.start = self.pos;

        let Some(&c) = self.input.get(self.pos) else {
            return self.token(SqlTokenKind::Eof);
        };

        match c {
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.scan_word(),
            b'0'..=b'9' => self.scan_number(),
            b'\'' | b'"' => self.scan_string(c),
            b'-' if self.peek() == Some(b'-') => self.scan_line_comment(),
            b'/' if self.peek() == Some(b'*') => self.scan_block_comment(),
            b'+' | b'-' | b'*' | b'/' | b'=' | b'<' | b'>' | b'!' => {
                self.pos += 1;
                self.token(SqlTokenKind::Operator)
            }
            _ => {
                self.pos += 1;
                self.token(SqlTokenKind::Error)
            }
        }
    }

    fn token(&self, kind: SqlTokenKind) -> SqlToken {
        SqlToken {
            kind,
            value: String::from_utf8_lossy(&self.input[self.start..self.pos]).into_owned(),
            pos: self.start,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos + 1).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(&c) = self.input.get(self.pos) {
            if c == b' ' || c == b'\t' || c == b'\n' || c == b'\r' {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn scan_word(&mut self) -> SqlToken {
        while let Some(&c) = self.input.get(self.pos) {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let mut tok = self.token(SqlTokenKind::Identifier);
        if SQL_KEYWORDS.iter().any(|k| tok.value.eq_ignore_ascii_case(k)) {
            tok.kind = SqlTokenKind::Keyword;
        }
        tok
    }

    fn scan_number(&mut self) -> SqlToken {
        while let Some(&c) = self.input.get(self.pos) {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.token(SqlTokenKind::Number)
    }

    fn scan_string(&mut self, quote: u8) -> SqlToken {
        self.pos += 1;
        while let Some(&c) = self.input.get(self.pos) {
            self.pos += 1;
            if c == quote && self.input[self.pos - 2] != b'\\' {
                break;
            }
        }
        self.token(SqlTokenKind::String)
    }

    fn scan_line_comment(&mut self) -> SqlToken {
        self.pos += 2;
        while let Some(&c) = self.input.get(self.pos) {
            if c == b'\n' {
                break;
            }
            self.pos += 1;
        }
        self.token(SqlTokenKind::Comment)
    }

    fn scan_block_comment(&mut self) -> SqlToken {
        self.pos += 2;
        while self.pos + 1 < self.input.len() {
            if self.input[self.pos] == b'*' && self.input[self.pos + 1] == b'/' {
                self.pos += 2;
                break;
            }
            self.pos += 1;
        }
        self.token(SqlTokenKind::Comment)
    }
}

/// Outcome of a detection pass.
#[derive(Debug, Clone)]
pub struct SqliVerdict {
    pub injected: bool,
    pub score: u32,
    pub reasons: Vec<String>,
}

impl SqliVerdict {
    /// Joined reason list, the message of [`SqliVerdict::as_error`].
    pub fn message(&self) -> String {
        self.reasons.join("; ")
    }

    pub fn as_error(&self) -> Option<WafError> {
        self.injected
            .then(|| WafError::sql_injection(self.message()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliDetector;

impl SqliDetector {
    pub fn new() -> Self {
        Self
    }

    /// Lex the input and score the token stream. Empty input is a validation
    /// error, not a negative verdict.
    pub fn detect(&self, input: &str) -> WafResult<SqliVerdict> {
        if input.is_empty() {
            return Err(WafError::validation("detector input must not be empty"));
        }

        let mut lexer = SqlLexer::new(input);
        let mut tokens = Vec::new();
        loop {
            let tok = lexer.next_token();
            if tok.kind == SqlTokenKind::Eof {
                break;
            }
            tokens.push(tok);
        }

        let mut score = 0;
        let mut reasons = Vec::new();

        if has_union_select(&tokens) {
            score += WEIGHT_UNION_SELECT;
            reasons.push("union select injection".to_string());
        }
        if has_always_true_condition(&tokens) {
            score += WEIGHT_ALWAYS_TRUE;
            reasons.push("always-true condition".to_string());
        }
        if has_comment_truncation(&tokens) {
            score += WEIGHT_COMMENT_TRUNCATION;
            reasons.push("comment truncation".to_string());
        }

        Ok(SqliVerdict {
            injected: score >= INJECTION_THRESHOLD,
            score,
            reasons,
        })
    }
}

fn has_union_select(tokens: &[SqlToken]) -> bool {
    tokens.windows(2).any(|w| {
        w[0].kind == SqlTokenKind::Keyword
            && w[0].value.eq_ignore_ascii_case("union")
            && w[1].kind == SqlTokenKind::Keyword
            && w[1].value.eq_ignore_ascii_case("select")
    })
}

fn has_always_true_condition(tokens: &[SqlToken]) -> bool {
    tokens.windows(3).any(|w| {
        w[0].kind == SqlTokenKind::Number
            && w[1].kind == SqlTokenKind::Operator
            && w[1].value == "="
            && w[2].kind == SqlTokenKind::Number
            && w[0].value == w[2].value
    })
}

fn has_comment_truncation(tokens: &[SqlToken]) -> bool {
    tokens.windows(2).any(|w| {
        w[0].kind == SqlTokenKind::Operator && w[1].kind == SqlTokenKind::Comment
    })
}
