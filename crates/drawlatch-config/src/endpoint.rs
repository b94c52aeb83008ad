//! Endpoint allowlist matching.
//!
//! Patterns are globs over full URLs: `**` matches any run of characters
//! including `/`, `*` matches within a single path segment. The scheme and
//! host compare case-sensitively, the path case-insensitively. The query
//! string participates in matching only when the pattern itself contains `?`.

/// Returns true iff `url` matches at least one allowlist pattern.
pub fn is_endpoint_allowed(url: &str, patterns: &[String]) -> bool {
    patterns
        .iter()
        .any(|pattern| matches_endpoint_pattern(url, pattern))
}

fn matches_endpoint_pattern(url: &str, pattern: &str) -> bool {
    let url = if pattern.contains('?') {
        url
    } else {
        url.split('?').next().unwrap_or(url)
    };

    let (url_head, url_tail) = split_host_and_path(url);
    let (pattern_head, pattern_tail) = split_host_and_path(pattern);

    glob_match(pattern_head.as_bytes(), url_head.as_bytes())
        && glob_match(
            pattern_tail.to_ascii_lowercase().as_bytes(),
            url_tail.to_ascii_lowercase().as_bytes(),
        )
}

/// Splits `scheme://host[:port]` from the path-and-beyond remainder.
fn split_host_and_path(value: &str) -> (&str, &str) {
    let authority_start = match value.find("://") {
        Some(index) => index + 3,
        None => return (value, ""),
    };
    match value[authority_start..].find('/') {
        Some(offset) => value.split_at(authority_start + offset),
        None => (value, ""),
    }
}

/// Iterative glob matcher with `*` (single segment) and `**` (any run)
/// wildcards; linear backtracking over the candidate text.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let mut p = 0usize;
    let mut t = 0usize;
    // Saved backtrack points: (pattern index after the star, text index,
    // whether the star crosses '/').
    let mut star: Option<(usize, usize, bool)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    let crosses_slash = pattern.get(p + 1) == Some(&b'*');
                    let after = if crosses_slash { p + 2 } else { p + 1 };
                    star = Some((after, t, crosses_slash));
                    p = after;
                    continue;
                }
                literal if literal == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((after, consumed, crosses_slash)) => {
                if !crosses_slash && text[consumed] == b'/' {
                    return false;
                }
                star = Some((after, consumed + 1, crosses_slash));
                p = after;
                t = consumed + 1;
            }
            None => return false,
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed(url: &str, patterns: &[&str]) -> bool {
        let owned: Vec<String> = patterns.iter().map(|value| value.to_string()).collect();
        is_endpoint_allowed(url, &owned)
    }

    #[test]
    fn functional_double_star_matches_any_path_prefix() {
        assert!(allowed(
            "https://api.github.com/repos/x",
            &["https://api.github.com/**"]
        ));
        assert!(allowed(
            "https://api.github.com/repos/x/issues/5/comments",
            &["https://api.github.com/**"]
        ));
        assert!(!allowed(
            "https://evil.example/api",
            &["https://api.github.com/**"]
        ));
    }

    #[test]
    fn unit_single_star_stays_within_a_segment() {
        assert!(allowed(
            "https://api.example.com/v1/items",
            &["https://api.example.com/v1/*"]
        ));
        assert!(!allowed(
            "https://api.example.com/v1/items/42",
            &["https://api.example.com/v1/*"]
        ));
    }

    #[test]
    fn unit_host_is_case_sensitive_path_is_not() {
        assert!(!allowed(
            "https://API.github.com/repos",
            &["https://api.github.com/**"]
        ));
        assert!(allowed(
            "https://api.github.com/Repos/X",
            &["https://api.github.com/repos/**"]
        ));
    }

    #[test]
    fn unit_query_string_matters_only_when_pattern_has_one() {
        assert!(allowed(
            "https://api.example.com/search?q=alpha",
            &["https://api.example.com/search"]
        ));
        assert!(allowed(
            "https://api.example.com/search?q=alpha",
            &["https://api.example.com/search?q=*"]
        ));
        assert!(!allowed(
            "https://api.example.com/search?q=alpha",
            &["https://api.example.com/search?page=*"]
        ));
    }

    #[test]
    fn regression_empty_pattern_list_denies_everything() {
        assert!(!allowed("https://api.example.com/", &[]));
    }

    #[test]
    fn unit_exact_url_pattern_requires_exact_match() {
        assert!(allowed(
            "https://api.example.com/health",
            &["https://api.example.com/health"]
        ));
        assert!(!allowed(
            "https://api.example.com/healthz",
            &["https://api.example.com/health"]
        ));
    }

    #[test]
    fn regression_star_does_not_cross_into_longer_host() {
        // A wildcard host pattern must not widen into path territory.
        assert!(!allowed(
            "https://api.github.com.evil.example/x",
            &["https://api.github.com/**"]
        ));
    }
}
