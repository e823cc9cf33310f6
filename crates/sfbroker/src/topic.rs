// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Hierarchical topic matching.
//!
//! Topics and patterns are `/`-separated segment lists. A pattern segment may
//! be a wildcard:
//!
//! - `+` matches exactly one topic segment
//! - `*` matches zero or more topic segments
//!
//! Wildcards are only recognised as whole segments; `a+` or `b*c` compare
//! literally.
//!
//! # Example
//!
//! ```
//! use sfbroker::topic::topic_matches;
//!
//! assert!(topic_matches("upb/ec/100/temperature", "upb/+/100/*"));
//! assert!(topic_matches("a", "a/*"));
//! assert!(!topic_matches("a/b", "a/+/c"));
//! ```

/// Segment that matches exactly one topic segment.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Segment that matches any number of topic segments, including none.
pub const MULTI_LEVEL_WILDCARD: &str = "*";

/// Segment separator.
pub const SEPARATOR: char = '/';

/// Split a topic or pattern into segments.
///
/// The empty string yields no segments and a trailing separator does not
/// produce an empty last segment. A leading separator does yield an empty
/// first segment.
fn segments(s: &str) -> Vec<&str> {
    s.split_terminator(SEPARATOR).collect()
}

/// Returns `true` if `topic` is matched by `pattern`.
///
/// Runs a two-row dynamic program over (topic segment, pattern segment)
/// prefixes, so memory stays proportional to the pattern length.
pub fn topic_matches(topic: &str, pattern: &str) -> bool {
    let topic = segments(topic);
    let pattern = segments(pattern);
    let m = pattern.len();

    // prev[j]: first i topic segments matched by first j pattern segments
    let mut prev = vec![false; m + 1];
    let mut curr = vec![false; m + 1];

    prev[0] = true;
    for j in 1..=m {
        prev[j] = prev[j - 1] && pattern[j - 1] == MULTI_LEVEL_WILDCARD;
    }

    for segment in &topic {
        curr[0] = false;
        for j in 1..=m {
            curr[j] = match pattern[j - 1] {
                SINGLE_LEVEL_WILDCARD => prev[j - 1],
                MULTI_LEVEL_WILDCARD => curr[j - 1] || prev[j],
                literal => literal == *segment && prev[j - 1],
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[m]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_match() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b/d"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches("a/x/c", "a/+/c"));
        assert!(!topic_matches("a/c", "a/+/c"));
        assert!(!topic_matches("a/x/y/c", "a/+/c"));
        assert!(topic_matches("x/y", "+/+"));
        assert!(!topic_matches("x", "+/+"));
    }

    #[test]
    fn test_multi_level_wildcard_matches_zero_or_more() {
        assert!(topic_matches("a", "a/*"));
        assert!(topic_matches("a/b", "a/*"));
        assert!(topic_matches("a/b/c/d", "a/*"));
        assert!(!topic_matches("b/a", "a/*"));
    }

    #[test]
    fn test_multi_level_wildcard_in_the_middle() {
        assert!(topic_matches("a/d", "a/*/d"));
        assert!(topic_matches("a/b/c/d", "a/*/d"));
        assert!(!topic_matches("a/b/c", "a/*/d"));
    }

    #[test]
    fn test_bare_star_matches_everything() {
        assert!(topic_matches("", "*"));
        assert!(topic_matches("a", "*"));
        assert!(topic_matches("a/b/c", "*"));
    }

    #[test]
    fn test_mixed_wildcards() {
        assert!(topic_matches("upb/ec/100/temperature", "upb/+/100/*"));
        assert!(topic_matches("upb/ec/100", "upb/+/100/*"));
        assert!(!topic_matches("upb/100", "upb/+/100/*"));
        assert!(topic_matches("a/b/c", "*/+"));
        assert!(!topic_matches("", "*/+"));
    }

    #[test]
    fn test_embedded_wildcards_compare_literally() {
        assert!(!topic_matches("ab", "a+"));
        assert!(topic_matches("a+", "a+"));
        assert!(!topic_matches("bxc", "b*c"));
    }

    #[test]
    fn test_empty_topic_and_pattern() {
        assert!(topic_matches("", ""));
        assert!(!topic_matches("a", ""));
        assert!(!topic_matches("", "+"));
        assert!(!topic_matches("", "a"));
    }

    #[test]
    fn test_separator_edges() {
        // trailing separator is not an extra segment
        assert!(topic_matches("a/", "a"));
        assert!(topic_matches("a", "a/"));
        // leading separator is an empty first segment
        assert!(topic_matches("/a", "+/a"));
        assert!(!topic_matches("/a", "a"));
    }
}
