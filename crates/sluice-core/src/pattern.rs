//! # Pattern Matching
//!
//! Compiled name matching for file names and table identifiers.
//!
//! ## Syntaxes
//!
//! - **Glob**: `*` matches any run of characters within one path segment,
//!   `?` exactly one character. Everything else is literal.
//! - **Regex**: a regular expression, matched against the whole name
//!   ([`MatchScope::Full`]) or anywhere inside it ([`MatchScope::Partial`]).
//! - **Like**: SQL `LIKE` semantics, `%` for any run and `_` for one character.
//!
//! Patterns are compiled once, when a source is configured, so an invalid
//! regex is reported before any file is read.
//!
//! ## Example
//!
//! ```rust
//! use sluice_core::pattern::{PatternMatcher, PatternSyntax};
//!
//! let matcher = PatternMatcher::new("pattern_*").unwrap();
//! assert!(matcher.matches("pattern_check_processing_1.txt"));
//! assert!(!matcher.matches("dir/pattern_1.txt"));
//!
//! let table = PatternMatcher::builder("ORDERS_%")
//!     .syntax(PatternSyntax::Like)
//!     .case_insensitive(true)
//!     .build()
//!     .unwrap();
//! assert!(table.matches("orders_2024"));
//! ```

use regex::{Regex, RegexBuilder};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Pattern syntax type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternSyntax {
    /// Glob syntax: `*` and `?` within a single path segment
    #[default]
    Glob,
    /// Regular expression syntax
    Regex,
    /// SQL LIKE syntax: `%` and `_`
    Like,
}

/// How much of the text a regex must cover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchScope {
    /// The whole text must match
    #[default]
    Full,
    /// Any substring may match
    Partial,
}

/// Error type for pattern operations
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("Invalid regex pattern: {0}")]
    InvalidRegex(#[from] regex::Error),
    #[error("Empty pattern")]
    EmptyPattern,
}

/// A compiled pattern matcher
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    pattern: String,
    syntax: PatternSyntax,
    regex: Regex,
    is_wildcard: bool,
}

/// Builder for [`PatternMatcher`].
#[derive(Debug, Clone)]
pub struct PatternMatcherBuilder {
    pattern: String,
    syntax: PatternSyntax,
    scope: MatchScope,
    case_insensitive: bool,
}

impl PatternMatcherBuilder {
    pub fn syntax(mut self, syntax: PatternSyntax) -> Self {
        self.syntax = syntax;
        self
    }

    /// Only meaningful for [`PatternSyntax::Regex`]; glob and like always match fully.
    pub fn scope(mut self, scope: MatchScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn case_insensitive(mut self, enabled: bool) -> Self {
        self.case_insensitive = enabled;
        self
    }

    pub fn build(self) -> Result<PatternMatcher, PatternError> {
        if self.pattern.is_empty() {
            return Err(PatternError::EmptyPattern);
        }

        let is_wildcard = match self.syntax {
            PatternSyntax::Glob => false,
            PatternSyntax::Like => self.pattern.chars().all(|c| c == '%'),
            PatternSyntax::Regex => self.pattern == ".*" || self.pattern == "^.*$",
        };

        let regex_pattern = match (self.syntax, self.scope) {
            (PatternSyntax::Glob, _) => glob_to_regex(&self.pattern),
            (PatternSyntax::Like, _) => like_to_regex(&self.pattern),
            (PatternSyntax::Regex, MatchScope::Full) => format!("^(?:{})$", self.pattern),
            (PatternSyntax::Regex, MatchScope::Partial) => self.pattern.clone(),
        };

        let regex = RegexBuilder::new(&regex_pattern)
            .case_insensitive(self.case_insensitive)
            .build()?;

        Ok(PatternMatcher {
            pattern: self.pattern,
            syntax: self.syntax,
            regex,
            is_wildcard,
        })
    }
}

impl PatternMatcher {
    /// Case-sensitive glob matcher.
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        Self::builder(pattern).build()
    }

    /// Case-sensitive matcher with explicit syntax and full-text scope.
    pub fn with_syntax(pattern: &str, syntax: PatternSyntax) -> Result<Self, PatternError> {
        Self::builder(pattern).syntax(syntax).build()
    }

    pub fn builder(pattern: &str) -> PatternMatcherBuilder {
        PatternMatcherBuilder {
            pattern: pattern.to_string(),
            syntax: PatternSyntax::Glob,
            scope: MatchScope::Full,
            case_insensitive: false,
        }
    }

    /// Check if text matches the pattern
    #[inline]
    pub fn matches(&self, text: &str) -> bool {
        if self.is_wildcard {
            return true;
        }
        self.regex.is_match(text)
    }

    /// Get the original pattern string
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn syntax(&self) -> PatternSyntax {
        self.syntax
    }

    /// Check if this pattern matches everything
    pub fn is_wildcard(&self) -> bool {
        self.is_wildcard
    }
}

/// Convert a glob pattern to an anchored regex.
///
/// `*` and `?` never cross a `/`.
fn glob_to_regex(pattern: &str) -> String {
    let escaped = regex::escape(pattern);
    let regex_pattern = escaped.replace(r"\*", "[^/]*").replace(r"\?", "[^/]");
    format!("^{}$", regex_pattern)
}

/// Convert a SQL LIKE pattern to an anchored regex.
fn like_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for c in pattern.chars() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_glob_exact_is_case_sensitive() {
        let matcher = PatternMatcher::new("pattern_check_processing_1.txt").unwrap();
        assert!(matcher.matches("pattern_check_processing_1.txt"));
        assert!(!matcher.matches("PATTERN_check_processing_1.txt"));
        assert!(!matcher.matches("pattern_check_processing_22.txt"));
    }

    #[test]
    fn test_glob_star_variants() {
        for pattern in ["*.txt", "pattern_*", "*_check_*"] {
            let matcher = PatternMatcher::new(pattern).unwrap();
            assert!(matcher.matches("pattern_check_processing_1.txt"), "{pattern}");
            assert!(matcher.matches("pattern_check_processing_22.txt"), "{pattern}");
        }
        let matcher = PatternMatcher::new("*.txt").unwrap();
        assert!(!matcher.matches("data.csv"));
    }

    #[test]
    fn test_glob_star_stays_in_segment() {
        let matcher = PatternMatcher::new("*.txt").unwrap();
        assert!(!matcher.matches("nested/file.txt"));
        let matcher = PatternMatcher::new("file?.txt").unwrap();
        assert!(matcher.matches("file1.txt"));
        assert!(!matcher.matches("file/.txt"));
    }

    #[test]
    fn test_glob_escapes_regex_chars() {
        let matcher = PatternMatcher::new("table[1].log").unwrap();
        assert!(matcher.matches("table[1].log"));
        assert!(!matcher.matches("table1xlog"));
    }

    #[test]
    fn test_regex_full_and_partial() {
        let full = PatternMatcher::with_syntax(r"^p(.*)([0-9]{1})(\.txt)", PatternSyntax::Regex)
            .unwrap();
        assert!(full.matches("pattern_check_processing_1.txt"));
        assert!(!full.matches("pattern_check_processing_1.txt.bak"));

        let partial = PatternMatcher::builder(r"processing")
            .syntax(PatternSyntax::Regex)
            .scope(MatchScope::Partial)
            .build()
            .unwrap();
        assert!(partial.matches("pattern_check_processing_1.txt"));
        assert!(!partial.matches("other.txt"));
    }

    #[test]
    fn test_like_patterns() {
        let matcher = PatternMatcher::builder("TEST_TABLE%")
            .syntax(PatternSyntax::Like)
            .case_insensitive(true)
            .build()
            .unwrap();
        assert!(matcher.matches("test_table_ab"));
        assert!(matcher.matches("TEST_TABLE"));
        assert!(!matcher.matches("OTHER"));

        let single = PatternMatcher::with_syntax("T_", PatternSyntax::Like).unwrap();
        assert!(single.matches("T1"));
        assert!(!single.matches("T12"));

        let all = PatternMatcher::with_syntax("%", PatternSyntax::Like).unwrap();
        assert!(all.is_wildcard());
        assert!(all.matches("anything"));
    }

    #[test]
    fn test_error_cases() {
        assert!(matches!(
            PatternMatcher::new(""),
            Err(PatternError::EmptyPattern)
        ));
        assert!(matches!(
            PatternMatcher::with_syntax("[invalid", PatternSyntax::Regex),
            Err(PatternError::InvalidRegex(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_literal_glob_matches_itself(name in "[a-zA-Z0-9_.\\-\\[\\]()+]{1,32}") {
            let matcher = PatternMatcher::new(&name).unwrap();
            prop_assert!(matcher.matches(&name));
        }

        #[test]
        fn prop_star_never_crosses_segments(a in "[a-z]{1,8}", b in "[a-z]{1,8}") {
            let matcher = PatternMatcher::new("*").unwrap();
            let single = format!("{a}{b}");
            let nested = format!("{a}/{b}");
            prop_assert!(matcher.matches(&single));
            prop_assert!(!matcher.matches(&nested));
        }
    }
}
