//! Route visibility matching.
//!
//! Glob semantics: `*` matches any run of characters (including none), `?` matches
//! exactly one character, everything else is literal. A leading `!` turns a pattern
//! into an exclusion.

use regex::Regex;
use tracing::debug;

/// Compiled include/exclude rules for one extension.
#[derive(Debug, Clone, Default)]
pub struct RouteMatcher {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl RouteMatcher {
    /// Compile a list of patterns. Patterns that fail to compile are skipped.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut matcher = Self::default();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            let (negated, glob) = match pattern.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, pattern),
            };
            match glob_to_regex(glob) {
                Ok(re) if negated => matcher.exclude.push(re),
                Ok(re) => matcher.include.push(re),
                Err(e) => debug!(category = "plugins", pattern, error = %e, "Skipping route pattern"),
            }
        }
        matcher
    }

    /// Eligible iff (no includes, or one include matches) and no exclude matches.
    pub fn matches(&self, path: &str) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|re| re.is_match(path));
        included && !self.exclude.iter().any(|re| re.is_match(path))
    }
}

/// Anchored regex for one glob.
pub fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let mut source = String::with_capacity(glob.len() + 8);
    source.push('^');
    let mut literal = [0u8; 4];
    for ch in glob.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut literal))),
        }
    }
    source.push('$');
    Regex::new(&source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_matches_any_run() {
        let matcher = RouteMatcher::new(&["/docs/*"]);
        assert!(matcher.matches("/docs/123"));
        assert!(matcher.matches("/docs/"));
        assert!(matcher.matches("/docs/a/b"));
        assert!(!matcher.matches("/settings"));
        assert!(!matcher.matches("/docs"));
    }

    #[test]
    fn test_negation() {
        let matcher = RouteMatcher::new(&["/docs/*", "!/docs/new"]);
        assert!(matcher.matches("/docs/123"));
        assert!(!matcher.matches("/docs/new"));
    }

    #[test]
    fn test_only_exclusions_means_everywhere_else() {
        let matcher = RouteMatcher::new(&["!/login"]);
        assert!(matcher.matches("/docs/1"));
        assert!(!matcher.matches("/login"));
    }

    #[test]
    fn test_empty_patterns_match_everything() {
        let matcher = RouteMatcher::new::<&str>(&[]);
        assert!(matcher.matches("/"));
        assert!(matcher.matches("/anything/at/all"));
    }

    #[test]
    fn test_question_mark_is_single_char() {
        let matcher = RouteMatcher::new(&["/v?/api"]);
        assert!(matcher.matches("/v1/api"));
        assert!(!matcher.matches("/v10/api"));
        assert!(!matcher.matches("/v/api"));
    }

    #[test]
    fn test_metacharacters_are_literal() {
        let matcher = RouteMatcher::new(&["/a.b/(x)+"]);
        assert!(matcher.matches("/a.b/(x)+"));
        assert!(!matcher.matches("/aXb/(x)+"));
        assert!(!matcher.matches("/a.b/xx"));
    }
}
