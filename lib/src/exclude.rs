//! Exclusion lists in the style of `.containerignore` files.
//!
//! Patterns are shell globs matched against paths relative to the root,
//! with `**` standing for any number of directories.  A pattern prefixed
//! with `!` re-includes what an earlier pattern excluded; the last
//! matching pattern decides.  A pattern that matches a leading directory
//! of a path also matches the path itself, so excluding `foo` excludes
//! everything below it unless re-included.

use anyhow::Context;
use camino::Utf8Path;
use glob::{MatchOptions, Pattern};

use crate::Result;

/// Options shared by exclusion matching and glob expansion.
pub(crate) const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct ExcludePattern {
    pattern: Pattern,
    /// Set for `!` patterns
    reinclude: bool,
}

/// A compiled, ordered exclusion list.
#[derive(Debug, Clone, Default)]
pub struct ExcludeMatcher {
    patterns: Vec<ExcludePattern>,
}

impl ExcludeMatcher {
    /// Compile a list of patterns.  Blank entries are ignored; any
    /// malformed pattern fails the whole list.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let raw = raw.as_ref().trim();
            let (reinclude, body) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest.trim()),
                None => (false, raw),
            };
            if body.is_empty() {
                continue;
            }
            let cleaned = tarcopy_utils::clean(body);
            let cleaned = cleaned.as_str().trim_start_matches('/');
            let cleaned = if cleaned.is_empty() { "." } else { cleaned };
            let pattern = Pattern::new(cleaned)
                .with_context(|| format!("Invalid exclude pattern {raw:?}"))?;
            compiled.push(ExcludePattern {
                pattern,
                reinclude,
            });
        }
        Ok(Self { patterns: compiled })
    }

    /// True if there are no patterns at all.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether `rel`, a path relative to the root, is excluded.  The root
    /// itself (`.`) never is.
    pub fn matches(&self, rel: &Utf8Path) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let rel = tarcopy_utils::clean_relative(rel);
        let rel = rel.as_str();
        if rel == "." {
            return false;
        }
        let components: Vec<&str> = rel.split('/').collect();
        let ancestors: Vec<String> = (1..components.len())
            .map(|n| components[..n].join("/"))
            .collect();
        let mut excluded = false;
        for p in &self.patterns {
            let hit = p.pattern.matches_with(rel, MATCH_OPTIONS)
                || ancestors
                    .iter()
                    .any(|a| p.pattern.matches_with(a, MATCH_OPTIONS));
            if hit {
                excluded = !p.reinclude;
            }
        }
        excluded
    }
}
