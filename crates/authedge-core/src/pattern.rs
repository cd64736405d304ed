//! Resource pattern matching for permission claims.
//!
//! Supported forms:
//!
//! | Pattern              | Matches                                          |
//! |----------------------|--------------------------------------------------|
//! | `/api/customers/42`  | exactly that path                                |
//! | `/api/customers/**`  | `/api/customers` and everything below it         |
//! | `/api/customers/*`   | direct children only (`/api/customers/42`)       |
//! | `**`, `/*`, `/**`    | every path                                       |

/// Patterns that grant access to every path.
pub const UNIVERSAL_PATTERNS: [&str; 3] = ["**", "/*", "/**"];

/// Returns `true` when `pattern` covers `path`.
pub fn matches(pattern: &str, path: &str) -> bool {
    if UNIVERSAL_PATTERNS.contains(&pattern) {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix("/**") {
        return path == prefix
            || path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'));
    }

    if let Some(prefix) = pattern.strip_suffix("/*") {
        return path
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .is_some_and(|child| !child.is_empty() && !child.contains('/'));
    }

    pattern == path
}

/// Every pattern string that could match `path`.
///
/// Used to probe exact-keyed indexes (such as the permission filter) for
/// grants written as wildcards. The list may contain patterns that do not
/// actually match, but never omits one that does.
pub fn covering_patterns(path: &str) -> Vec<String> {
    let mut patterns = Vec::with_capacity(path.len() / 4 + 6);
    patterns.push(path.to_string());

    // `<ancestor>/**` for the path itself and each ancestor, root included.
    patterns.push(format!("{path}/**"));
    for (idx, _) in path.match_indices('/') {
        let ancestor = &path[..idx];
        if !ancestor.is_empty() {
            patterns.push(format!("{ancestor}/**"));
        }
    }

    // `<parent>/*` for direct children.
    if let Some(idx) = path.rfind('/') {
        let parent = &path[..idx];
        if !parent.is_empty() {
            patterns.push(format!("{parent}/*"));
        }
    }

    patterns.extend(UNIVERSAL_PATTERNS.iter().map(|p| (*p).to_string()));
    patterns.dedup();
    patterns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(matches("/api/customers/42", "/api/customers/42"));
        assert!(!matches("/api/customers/42", "/api/customers/43"));
    }

    #[test]
    fn test_double_wildcard_any_depth() {
        assert!(matches("/api/customers/**", "/api/customers/42/contacts"));
        assert!(matches("/api/customers/**", "/api/customers/42"));
        assert!(matches("/api/customers/**", "/api/customers"));
        assert!(!matches("/api/customers/**", "/api/customersfoo"));
        assert!(!matches("/api/customers/**", "/api/orders/1"));
    }

    #[test]
    fn test_single_wildcard_direct_children_only() {
        assert!(matches("/api/customers/*", "/api/customers/42"));
        assert!(!matches("/api/customers/*", "/api/customers/42/contacts"));
        assert!(!matches("/api/customers/*", "/api/customers"));
        assert!(!matches("/api/customers/*", "/api/customers/"));
    }

    #[test]
    fn test_universal_patterns() {
        for pattern in UNIVERSAL_PATTERNS {
            assert!(matches(pattern, "/anything/at/all"));
            assert!(matches(pattern, "/"));
        }
    }

    #[test]
    fn test_covering_patterns_include_every_match() {
        let path = "/api/customers/42/contacts";
        let candidates = covering_patterns(path);

        for pattern in [
            "/api/customers/42/contacts",
            "/api/customers/42/contacts/**",
            "/api/customers/42/**",
            "/api/customers/**",
            "/api/**",
            "/api/customers/42/*",
            "**",
            "/*",
            "/**",
        ] {
            assert!(matches(pattern, path), "{pattern} should match");
            assert!(
                candidates.iter().any(|c| c == pattern),
                "{pattern} missing from candidates"
            );
        }

        assert!(!candidates.iter().any(|c| c == "/api/customers/*"));
    }
}
