//! Allow/block glob filtering of device names.
//!
//! Patterns use shell glob syntax: `*` matches any run of characters, `?`
//! a single character and `[...]` a character class. Matching is
//! case-sensitive.

use glob::Pattern;
use snafu::ResultExt;

use crate::error::{FilterPatternSnafu, Result};

/// Compiled allow and block pattern lists, immutable once built.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    allow: Vec<Pattern>,
    block: Vec<Pattern>,
}

impl Filters {
    /// Compiles both pattern lists, failing on the first invalid pattern.
    pub fn new<S: AsRef<str>>(allow: &[S], block: &[S]) -> Result<Self> {
        Ok(Self {
            allow: compile(allow)?,
            block: compile(block)?,
        })
    }

    /// Returns true when no pattern of either kind is configured.
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.block.is_empty()
    }

    /// A name passes if it matches an allow pattern and no block pattern.
    pub fn passes(&self, name: &str) -> bool {
        passes_filters(name, &self.allow, &self.block)
    }
}

fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            let p = p.as_ref();
            Pattern::new(p).context(FilterPatternSnafu { pattern: p })
        })
        .collect()
}

/// Block takes precedence over allow; an empty allow list lets nothing through.
pub fn passes_filters(name: &str, allow: &[Pattern], block: &[Pattern]) -> bool {
    if !allow.iter().any(|p| p.matches(name)) {
        return false;
    }

    !block.iter().any(|p| p.matches(name))
}
