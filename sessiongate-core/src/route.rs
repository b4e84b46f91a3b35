//! Route classification for inbound requests.
//!
//! # Overview
//!
//! Every inbound path is mapped to exactly one [`RouteClass`] by testing it
//! against a fixed, ordered table of patterns. The first match wins; a path
//! matching nothing is [`RouteClass::Default`] and gets transparent proxying.
//!
//! | Order | Pattern | Class |
//! |-------|---------|-------|
//! | 1 | `^/login$` | `DirectLogin` |
//! | 2 | `^/login_oauth$` | `Login` |
//! | 3 | `^/api/organizations/.*/chat_conversations/.*/completion$` | `Completion` |
//! | - | (no match) | `Default` |
//!
//! Classification is stateless and header-only: it never reads the body.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Handling strategy selected for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    /// `/login`: direct username login, no session required.
    DirectLogin,
    /// `/login_oauth`: OAuth-style login, no session required.
    Login,
    /// Chat completion endpoint: session-gated, quota-tracked.
    Completion,
    /// Everything else: transparent passthrough without auth.
    Default,
}

impl RouteClass {
    /// Stable label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectLogin => "direct_login",
            Self::Login => "login",
            Self::Completion => "completion",
            Self::Default => "default",
        }
    }
}

impl fmt::Display for RouteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered `(pattern, class)` pairs. Order is significant.
static ROUTE_PATTERNS: &[(&str, RouteClass)] = &[
    (r"^/login$", RouteClass::DirectLogin),
    (r"^/login_oauth$", RouteClass::Login),
    (
        r"^/api/organizations/.*/chat_conversations/.*/completion$",
        RouteClass::Completion,
    ),
];

static DEFAULT_TABLE: LazyLock<RouteTable> = LazyLock::new(RouteTable::compile);

/// Compiled, ordered route table.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<(Regex, RouteClass)>,
}

impl RouteTable {
    /// Shared instance of the fixed route table.
    pub fn global() -> &'static RouteTable {
        &DEFAULT_TABLE
    }

    fn compile() -> Self {
        let routes = ROUTE_PATTERNS
            .iter()
            .filter_map(|(pattern, class)| match Regex::new(pattern) {
                Ok(re) => Some((re, *class)),
                Err(e) => {
                    // Patterns are literals above; unreachable unless edited badly.
                    tracing::error!(pattern = %pattern, error = %e, "Invalid route pattern");
                    None
                }
            })
            .collect();
        Self { routes }
    }

    /// Classify a request path. First match wins.
    pub fn classify(&self, path: &str) -> RouteClass {
        self.routes
            .iter()
            .find(|(re, _)| re.is_match(path))
            .map(|(_, class)| *class)
            .unwrap_or(RouteClass::Default)
    }
}

/// Classify a path against the global route table.
///
/// # Example
///
/// ```rust
/// use sessiongate_core::route::{RouteClass, classify};
///
/// assert_eq!(classify("/login"), RouteClass::DirectLogin);
/// assert_eq!(classify("/api/bootstrap"), RouteClass::Default);
/// ```
#[inline]
pub fn classify(path: &str) -> RouteClass {
    RouteTable::global().classify(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPLETION: &str = "/api/organizations/org-1/chat_conversations/conv-9/completion";

    #[test]
    fn test_login_routes() {
        assert_eq!(classify("/login"), RouteClass::DirectLogin);
        assert_eq!(classify("/login_oauth"), RouteClass::Login);
    }

    #[test]
    fn test_completion_route() {
        assert_eq!(classify(COMPLETION), RouteClass::Completion);
    }

    #[test]
    fn test_completion_wildcards_span_segments() {
        // `.*` is greedy and crosses slashes, as in the original pattern
        assert_eq!(
            classify("/api/organizations/a/b/chat_conversations/c/d/completion"),
            RouteClass::Completion
        );
        // Empty segments still match `.*`
        assert_eq!(
            classify("/api/organizations//chat_conversations//completion"),
            RouteClass::Completion
        );
    }

    #[test]
    fn test_anchors_are_exact() {
        assert_eq!(classify("/login/"), RouteClass::Default);
        assert_eq!(classify("/loginx"), RouteClass::Default);
        assert_eq!(classify("/v1/login"), RouteClass::Default);
        assert_eq!(classify(&format!("{COMPLETION}/")), RouteClass::Default);
        assert_eq!(
            classify("/api/organizations/o/chat_conversations/c/completion_status"),
            RouteClass::Default
        );
    }

    #[test]
    fn test_unmatched_routes_default() {
        for path in [
            "/",
            "/logout",
            "/api/bootstrap/org/statsig",
            "/api/organizations/o/chat_conversations",
            "/assets/app.js",
        ] {
            assert_eq!(classify(path), RouteClass::Default, "path {path}");
        }
    }

    #[test]
    fn test_table_keeps_all_patterns() {
        assert_eq!(RouteTable::global().routes.len(), ROUTE_PATTERNS.len());
    }

    #[test]
    fn test_labels() {
        assert_eq!(RouteClass::Completion.to_string(), "completion");
        assert_eq!(RouteClass::DirectLogin.as_str(), "direct_login");
    }
}
