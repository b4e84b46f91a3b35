//! Gateway configuration.
//!
//! `GatewayConfig` is built once at process start, validated, and then shared
//! read-only (behind an `Arc`) by every request handler. Nothing in the request
//! path mutates it.
//!
//! # Environment Variables
//!
//! | Variable | Default | Purpose |
//! |----------|---------|---------|
//! | `SESSIONGATE_UPSTREAM_URL` | (required) | Absolute base URL of the chat API |
//! | `SESSIONGATE_SHARE_URL` | `https://example.com` | Redirect target after OAuth login |
//! | `SESSIONGATE_SESSION_COOKIE` | `username` | Session cookie name |
//! | `SESSIONGATE_COOKIE_MAX_AGE_DAYS` | `7` | Session cookie lifetime |
//! | `SESSIONGATE_IDENTITY_HEADER` | `cf-connecting-ip` | Client address header |
//! | `SESSIONGATE_RATE_LIMIT_BODY_MAX` | `65536` | Max 429 body parsed for quotas |

pub mod defaults;
pub mod error;

pub use defaults::*;
pub use error::ConfigError;

use http::Uri;
use http::header::HeaderName;
use std::time::Duration;
use tracing::warn;

/// Immutable runtime configuration for the gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upstream chat API base URL (scheme + authority, optional base path).
    upstream_url: Uri,
    /// Public URL the OAuth login flow redirects to.
    share_url: Uri,
    /// Name of the session cookie.
    session_cookie: String,
    /// Header carrying the client network identity.
    identity_header: HeaderName,
    /// Lifetime of cookies issued by the login flows.
    cookie_max_age: Duration,
    /// Max bytes of a 429 body collected for quota parsing.
    rate_limit_body_max: usize,
}

impl GatewayConfig {
    /// Create a configuration for the given upstream with all other settings
    /// at their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidUrl` if `upstream_url` is not an absolute
    /// `http`/`https` URL.
    pub fn new(upstream_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            upstream_url: parse_base_url(upstream_url)?,
            share_url: parse_base_url(DEFAULT_SHARE_URL)?,
            session_cookie: DEFAULT_SESSION_COOKIE.to_string(),
            identity_header: HeaderName::from_static(DEFAULT_IDENTITY_HEADER),
            cookie_max_age: Duration::from_secs(DEFAULT_COOKIE_MAX_AGE_DAYS * SECONDS_PER_DAY),
            rate_limit_body_max: DEFAULT_RATE_LIMIT_BODY_MAX,
        })
    }

    /// Load configuration from environment variables.
    ///
    /// `explicit_upstream` (from the CLI) takes precedence over
    /// `SESSIONGATE_UPSTREAM_URL`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the upstream URL is missing, or when any
    /// URL, header name or cookie name is malformed.
    pub fn from_env(explicit_upstream: Option<&str>) -> Result<Self, ConfigError> {
        let upstream = match explicit_upstream {
            Some(url) => url.to_string(),
            None => std::env::var("SESSIONGATE_UPSTREAM_URL").map_err(|_| {
                ConfigError::MissingEnvVar {
                    var: "SESSIONGATE_UPSTREAM_URL".to_string(),
                    field: "upstream_url".to_string(),
                }
            })?,
        };

        let mut config = Self::new(&upstream)?;

        if let Ok(share) = std::env::var("SESSIONGATE_SHARE_URL") {
            config = config.with_share_url(&share)?;
        }
        if let Ok(cookie) = std::env::var("SESSIONGATE_SESSION_COOKIE") {
            config = config.with_session_cookie(&cookie)?;
        }
        if let Ok(header) = std::env::var("SESSIONGATE_IDENTITY_HEADER") {
            config = config.with_identity_header(&header)?;
        }

        let days = parse_env_warn(
            "SESSIONGATE_COOKIE_MAX_AGE_DAYS",
            DEFAULT_COOKIE_MAX_AGE_DAYS,
        );
        let body_max = parse_env_warn(
            "SESSIONGATE_RATE_LIMIT_BODY_MAX",
            DEFAULT_RATE_LIMIT_BODY_MAX,
        );

        Ok(config
            .with_cookie_max_age(Duration::from_secs(days.saturating_mul(SECONDS_PER_DAY)))
            .with_rate_limit_body_max(body_max))
    }

    /// Override the public share URL.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidUrl` for a non-absolute URL.
    pub fn with_share_url(mut self, share_url: &str) -> Result<Self, ConfigError> {
        self.share_url = parse_base_url(share_url)?;
        Ok(self)
    }

    /// Override the session cookie name.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidCookieName` if the name is empty or
    /// contains separators, whitespace or control characters.
    pub fn with_session_cookie(mut self, name: &str) -> Result<Self, ConfigError> {
        if !is_valid_cookie_name(name) {
            return Err(ConfigError::InvalidCookieName {
                name: name.to_string(),
            });
        }
        self.session_cookie = name.to_string();
        Ok(self)
    }

    /// Override the client identity header.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidHeaderName` for an invalid header name.
    pub fn with_identity_header(mut self, name: &str) -> Result<Self, ConfigError> {
        self.identity_header =
            HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| {
                ConfigError::InvalidHeaderName {
                    name: name.to_string(),
                    field: "identity_header".to_string(),
                }
            })?;
        Ok(self)
    }

    /// Override the cookie lifetime.
    #[must_use]
    pub fn with_cookie_max_age(mut self, max_age: Duration) -> Self {
        self.cookie_max_age = max_age;
        self
    }

    /// Override the 429 body collection limit.
    #[must_use]
    pub fn with_rate_limit_body_max(mut self, max: usize) -> Self {
        self.rate_limit_body_max = max;
        self
    }

    pub fn upstream_url(&self) -> &Uri {
        &self.upstream_url
    }

    pub fn share_url(&self) -> &Uri {
        &self.share_url
    }

    pub fn session_cookie(&self) -> &str {
        &self.session_cookie
    }

    pub fn identity_header(&self) -> &HeaderName {
        &self.identity_header
    }

    pub fn cookie_max_age(&self) -> Duration {
        self.cookie_max_age
    }

    pub fn rate_limit_body_max(&self) -> usize {
        self.rate_limit_body_max
    }
}

/// Parse and validate an absolute `http`/`https` base URL.
fn parse_base_url(raw: &str) -> Result<Uri, ConfigError> {
    let trimmed = raw.trim();
    let uri: Uri = trimmed.parse().map_err(|e: http::uri::InvalidUri| {
        ConfigError::InvalidUrl {
            url: raw.to_string(),
            message: e.to_string(),
        }
    })?;

    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        Some(other) => {
            return Err(ConfigError::InvalidUrl {
                url: raw.to_string(),
                message: format!("unsupported scheme '{other}'"),
            });
        }
        None => {
            return Err(ConfigError::InvalidUrl {
                url: raw.to_string(),
                message: "missing scheme (expected http:// or https://)".to_string(),
            });
        }
    }

    if uri.authority().is_none() {
        return Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            message: "missing host".to_string(),
        });
    }

    if uri.query().is_some() {
        return Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            message: "base URL must not carry a query string".to_string(),
        });
    }

    Ok(uri)
}

/// RFC 6265 `token` check for cookie names.
fn is_valid_cookie_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_graphic()
                && !matches!(
                    b,
                    b'(' | b')'
                        | b'<'
                        | b'>'
                        | b'@'
                        | b','
                        | b';'
                        | b':'
                        | b'\\'
                        | b'"'
                        | b'/'
                        | b'['
                        | b']'
                        | b'?'
                        | b'='
                        | b'{'
                        | b'}'
                )
        })
}

/// Parse an environment variable with a warning on invalid values.
///
/// If the env var is set but cannot be parsed, logs a warning and returns the default.
/// If the env var is not set, returns the default silently.
pub fn parse_env_warn<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) => match val.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
