//! Ignore-rule engine
//!
//! Parses ignore-pattern files into path-matching predicates. Rules are
//! glob-like: `*` and `?` match within a path segment, `**` matches any
//! number of segments. A bare name (no leading `/`) is normalized to a
//! recursive match (`**/name`). The store's own reserved paths are always
//! excluded, whatever the rule file says.
//!
//! Rule sets are loaded fresh per sync operation, not cached across calls.

use crate::store::RESERVED_PATHS;

/// Fallback rules used when a vault has no ignore file
pub const DEFAULT_IGNORE_RULES: &str = ".git\nnode_modules\n.DS_Store\nThumbs.db\n";

/// One segment of a compiled pattern
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    /// `**`: any number of path segments, including zero
    Any,
    /// Literal segment, possibly containing `*` / `?`
    Match(String),
}

/// A compiled ignore pattern
#[derive(Debug, Clone, PartialEq)]
struct Pattern {
    segments: Vec<Segment>,
}

impl Pattern {
    fn compile(rule: &str) -> Self {
        let rule = rule.trim_end_matches('/');
        let segments = rule
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s == "**" {
                    Segment::Any
                } else {
                    Segment::Match(s.to_string())
                }
            })
            .collect();
        Self { segments }
    }

    fn matches(&self, path: &[&str]) -> bool {
        match_segments(&self.segments, path)
    }
}

/// Ordered set of ignore predicates for one sync/diff operation
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    patterns: Vec<Pattern>,
}

impl IgnoreRules {
    /// Parse rule text, normalizing bare names to recursive globs and
    /// appending the reserved store paths.
    pub fn parse(text: &str) -> Self {
        let mut patterns: Vec<Pattern> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| {
                if line.starts_with('/') {
                    Pattern::compile(line)
                } else {
                    Pattern::compile(&format!("**/{}", line))
                }
            })
            .collect();
        for reserved in RESERVED_PATHS {
            patterns.push(Pattern::compile(reserved));
        }
        Self { patterns }
    }

    /// The reserved-paths-only rule set (used by explicit path whitelists,
    /// which bypass the rule file but never expose store internals).
    pub fn reserved_only() -> Self {
        Self::parse("")
    }

    /// True if the normalized path matches any rule
    pub fn is_ignored(&self, path: &str) -> bool {
        let segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        self.patterns.iter().any(|p| p.matches(&segs))
    }
}

fn match_segments(pattern: &[Segment], path: &[&str]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(Segment::Any) => {
            // `**` consumes zero or more leading segments
            (0..=path.len()).any(|skip| match_segments(&pattern[1..], &path[skip..]))
        }
        Some(Segment::Match(pat)) => match path.first() {
            Some(seg) if match_component(pat.as_bytes(), seg.as_bytes()) => {
                match_segments(&pattern[1..], &path[1..])
            }
            _ => false,
        },
    }
}

/// Match a single path component against a pattern with `*` and `?`
fn match_component(pat: &[u8], text: &[u8]) -> bool {
    match (pat.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            match_component(&pat[1..], text)
                || (!text.is_empty() && match_component(pat, &text[1..]))
        }
        (Some(b'?'), Some(_)) => match_component(&pat[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => match_component(&pat[1..], &text[1..]),
        _ => false,
    }
}
