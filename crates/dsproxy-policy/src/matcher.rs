//! Path-style wildcard matching for tuple objects
//!
//! Patterns and objects are split on `/` and compared segment by segment.
//! Within a segment, `*` matches any (possibly empty) run of characters.
//! A bare `*` pattern matches every object.

/// Match an object such as `cluster1/default` against a tuple pattern
pub fn glob_match(pattern: &str, object: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let mut patterns = pattern.split('/');
    let mut objects = object.split('/');
    loop {
        match (patterns.next(), objects.next()) {
            (Some(p), Some(o)) => {
                if !segment_match(p, o) {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Match one path segment; `*` never crosses a `/` because segments contain none
pub fn segment_match(pattern: &str, segment: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = segment.chars().collect();
    let (mut pi, mut si) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while si < s.len() {
        if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, si));
            pi += 1;
        } else if pi < p.len() && p[pi] == s[si] {
            pi += 1;
            si += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            si = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

/// Whether a pattern contains a wildcard
pub fn is_pattern(s: &str) -> bool {
    s.contains('*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_objects_match() {
        assert!(glob_match("cluster1/default", "cluster1/default"));
        assert!(!glob_match("cluster1/default", "cluster1/defaults"));
        assert!(!glob_match("cluster1/default", "cluster2/default"));
    }

    #[test]
    fn any_cluster_any_namespace() {
        assert!(glob_match("*/*", "cluster1/default"));
        assert!(glob_match("*/*", "c/n"));
        assert!(!glob_match("*/*", "no-namespace"));
    }

    #[test]
    fn bare_star_matches_everything() {
        assert!(glob_match("*", "cluster1/default"));
        assert!(glob_match("*", "anything"));
    }

    #[test]
    fn namespace_wildcard_is_scoped_to_cluster() {
        assert!(glob_match("cluster1/*", "cluster1/monitoring"));
        assert!(!glob_match("cluster1/*", "cluster2/monitoring"));
    }

    #[test]
    fn star_does_not_cross_segments() {
        assert!(!glob_match("cluster*", "cluster1/default"));
        assert!(!glob_match("cluster1/*", "cluster1/a/b"));
    }

    #[test]
    fn embedded_and_trailing_stars() {
        assert!(glob_match("prod-*/team-*", "prod-eu/team-a"));
        assert!(glob_match("*-eu/*-a", "prod-eu/team-a"));
        assert!(glob_match("c/te*m-a", "c/team-a"));
        assert!(!glob_match("prod-*/team-*", "dev-eu/team-a"));
    }

    #[test]
    fn segment_backtracking() {
        assert!(segment_match("a*b*c", "aXbYbZc"));
        assert!(segment_match("*", ""));
        assert!(segment_match("a**", "a"));
        assert!(!segment_match("a*c", "ab"));
        assert!(!segment_match("", "a"));
    }
}
