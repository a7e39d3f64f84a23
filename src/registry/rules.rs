//! Wildcard matching for auto-discovery rules.
//!
//! Patterns support `*` (any run of characters, including empty) and `?`
//! (exactly one character). Matching is anchored at both ends and
//! case-sensitive.

use crate::config::DiscoveryRule;

/// Anchored glob match with `*` and `?`.
pub fn wildcard_match(pattern: &str, input: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let input: Vec<char> = input.chars().collect();

    let mut p = 0;
    let mut i = 0;
    // Backtrack point: position of the last `*` and the input position it
    // currently absorbs up to.
    let mut star: Option<usize> = None;
    let mut star_input = 0;

    while i < input.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == input[i]) {
            p += 1;
            i += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_input = i;
            p += 1;
        } else if let Some(star_pos) = star {
            // Let the last `*` absorb one more input character.
            p = star_pos + 1;
            star_input += 1;
            i = star_input;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

/// Decide whether a tool should be auto-discovered under the given rules.
///
/// A tool is discovered when at least one include rule matches it and no
/// exclude rule does. Excludes veto regardless of rule order.
pub fn should_discover(rules: &[DiscoveryRule], server_id: &str, tool_name: &str) -> bool {
    let mut included = false;
    for rule in rules {
        if wildcard_match(&rule.server_pattern, server_id)
            && wildcard_match(&rule.tool_pattern, tool_name)
        {
            if rule.exclude {
                return false;
            }
            included = true;
        }
    }
    included
}
