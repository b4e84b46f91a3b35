//! Configuration error types.

use thiserror::Error;

/// Configuration loading and validation errors.
///
/// Any of these aborts startup; numeric parse problems are not errors
/// (they fall back to the default with a warning).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is not set.
    #[error("environment variable '{var}' not set (required for field '{field}')")]
    MissingEnvVar { var: String, field: String },

    /// A URL-valued setting is not an absolute http(s) URL.
    #[error("invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    /// A header-name-valued setting is not a valid HTTP header name.
    #[error("invalid header name '{name}' for field '{field}'")]
    InvalidHeaderName { name: String, field: String },

    /// The session cookie name contains characters not allowed in a cookie name.
    #[error("invalid cookie name '{name}'")]
    InvalidCookieName { name: String },
}
