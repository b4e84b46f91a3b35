//! Session gate for protected routes.
//!
//! The gate passes a request when its `Cookie` header carries a non-empty
//! value for the configured session cookie. That presence check is the whole
//! of the validation: the value is not signed, not checked for expiry and not
//! looked up in storage. Expiry is enforced by the browser through the
//! cookie's own `Max-Age`.

use bytes::Bytes;
use http::header::{CONTENT_TYPE, COOKIE};
use http::{HeaderMap, Response, StatusCode};
use serde::Serialize;
use std::fmt;

/// Body returned to callers without a session.
pub const NOT_LOGGED_IN_BODY: &str = r#"{"status":"error","message":"Not logged in"}"#;

/// Opaque username carried by the session cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredential(String);

impl SessionCredential {
    pub fn new(username: impl Into<String>) -> Self {
        Self(username.into())
    }

    pub fn username(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of running the session gate.
#[derive(Debug)]
pub enum AuthOutcome {
    /// A session cookie is present; the caller may proceed.
    Authenticated(SessionCredential),
    /// Terminal response to send back; no upstream call may follow.
    Rejected(Response<Bytes>),
}

/// JSON error envelope used by the gate and the login flows.
#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    pub status: &'static str,
    pub message: &'a str,
}

/// Session gate keyed on a cookie name.
#[derive(Debug, Clone)]
pub struct AuthGuard {
    cookie_name: String,
}

impl AuthGuard {
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Check the request headers for a session cookie.
    pub fn check(&self, headers: &HeaderMap) -> AuthOutcome {
        match cookie_value(headers, &self.cookie_name) {
            Some(username) => AuthOutcome::Authenticated(SessionCredential::new(username)),
            None => AuthOutcome::Rejected(not_logged_in()),
        }
    }
}

/// Build the 401 `Not logged in` response.
pub fn not_logged_in() -> Response<Bytes> {
    json_response(StatusCode::UNAUTHORIZED, Bytes::from_static(NOT_LOGGED_IN_BODY.as_bytes()))
}

/// Build a JSON response with the given status and pre-encoded body.
pub fn json_response(status: StatusCode, body: Bytes) -> Response<Bytes> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    response
}

/// Find a cookie value by name across all `Cookie` headers.
///
/// Empty values count as absent. Surrounding double quotes are stripped.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| k.trim() == name)
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
}
