//! Wildcard patterns compiled to anchored regular expressions.

use regex::{Regex, RegexBuilder};

use super::error::{RouteError, RouteResult};

/// A wildcard pattern where `*` matches any run of characters and every other
/// character, `.` included, is literal.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    /// Compile a case-sensitive pattern.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidPattern`] if the pattern does not compile.
    pub fn new(pattern: &str) -> RouteResult<Self> {
        Self::compile(pattern, false)
    }

    /// Compile a pattern for hostnames, which compare ASCII case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidPattern`] if the pattern does not compile.
    pub fn hostname(pattern: &str) -> RouteResult<Self> {
        Self::compile(pattern, true)
    }

    fn compile(pattern: &str, case_insensitive: bool) -> RouteResult<Self> {
        let body: Vec<String> = pattern.split('*').map(regex::escape).collect();
        let expression = format!("^{}$", body.join(".*"));
        let regex = RegexBuilder::new(&expression)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|source| RouteError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Whether `candidate` matches the whole pattern.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }

    /// The pattern as configured.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.regex.as_str() == other.regex.as_str()
    }
}

impl Eq for Pattern {}

/// Match an optional pattern against an optional candidate. No pattern
/// matches anything, a pattern never matches a missing candidate.
#[must_use]
pub fn matches_optional(pattern: Option<&Pattern>, candidate: Option<&str>) -> bool {
    match (pattern, candidate) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(pattern), Some(candidate)) => pattern.matches(candidate),
    }
}
