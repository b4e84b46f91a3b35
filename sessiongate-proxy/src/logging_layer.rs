//! Tower layer for structured request/response logging.
//!
//! `tower_http::trace::TraceLayer` does the plumbing. The callbacks here add a
//! request id to every span and redact session material when headers are
//! logged.

use http::HeaderMap;
use std::fmt;
use tower_http::classify::{ServerErrorsAsFailures, ServerErrorsFailureClass, SharedClassifier};
use tower_http::trace::{
    DefaultOnBodyChunk, DefaultOnEos, MakeSpan, OnFailure, OnRequest, OnResponse, TraceLayer,
};
use tracing::{info, warn};

/// Headers that are never written to logs.
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "x-api-key",
    "x-auth-token",
    "proxy-authorization",
    "set-cookie",
];

const MAX_HEADERS_TO_LOG: usize = 50;
const MAX_VALUE_LEN: usize = 1024;

/// Request tracing layer for the dispatcher.
pub fn logging_layer() -> TraceLayer<
    SharedClassifier<ServerErrorsAsFailures>,
    RequestIdMakeSpan,
    OnRequestLogger,
    OnResponseLogger,
    DefaultOnBodyChunk,
    DefaultOnEos,
    OnFailureLogger,
> {
    TraceLayer::new_for_http()
        .make_span_with(RequestIdMakeSpan)
        .on_request(OnRequestLogger)
        .on_response(OnResponseLogger)
        .on_failure(OnFailureLogger)
}

/// Opens a `request` span carrying `x-request-id`, or a fresh v4 UUID.
#[derive(Clone, Debug)]
pub struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &hyper::Request<B>) -> tracing::Span {
        let request_id = request
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_owned())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            version = ?request.version(),
            request_id = %request_id,
        )
    }
}

#[derive(Clone, Debug)]
pub struct OnRequestLogger;

impl<B> OnRequest<B> for OnRequestLogger {
    fn on_request(&mut self, request: &hyper::Request<B>, _span: &tracing::Span) {
        info!(
            method = %request.method(),
            uri = %request.uri(),
            direction = "inbound",
            "Request received"
        );

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                version = ?request.version(),
                headers = ?SanitizedHeaders(request.headers()),
                "Request details"
            );
        }
    }
}

/// Logs status and time to first byte. Streamed bodies keep flowing after this.
#[derive(Clone, Debug)]
pub struct OnResponseLogger;

impl<B> OnResponse<B> for OnResponseLogger {
    fn on_response(
        self,
        response: &hyper::Response<B>,
        latency: std::time::Duration,
        _span: &tracing::Span,
    ) {
        info!(
            status = %response.status().as_u16(),
            latency_ms = latency.as_millis(),
            direction = "outbound",
            "Response sent"
        );

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                version = ?response.version(),
                headers = ?SanitizedHeaders(response.headers()),
                "Response details"
            );
        }
    }
}

#[derive(Clone, Debug)]
pub struct OnFailureLogger;

impl OnFailure<ServerErrorsFailureClass> for OnFailureLogger {
    fn on_failure(
        &mut self,
        failure: ServerErrorsFailureClass,
        latency: std::time::Duration,
        _span: &tracing::Span,
    ) {
        warn!(
            classification = %failure,
            latency_ms = latency.as_millis(),
            direction = "error",
            "Request failed"
        );
    }
}

/// Debug view of a header map with sensitive values redacted.
pub struct SanitizedHeaders<'a>(pub &'a HeaderMap);

impl fmt::Debug for SanitizedHeaders<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();

        for (idx, (name, value)) in self.0.iter().enumerate() {
            if idx >= MAX_HEADERS_TO_LOG {
                map.entry(&"...", &format!("({} more headers)", self.0.len() - idx));
                break;
            }

            let name_str = name.as_str();
            let is_sensitive = SENSITIVE_HEADERS
                .iter()
                .any(|&sensitive| name_str.eq_ignore_ascii_case(sensitive));

            if is_sensitive {
                map.entry(&name_str, &"[REDACTED]");
                continue;
            }

            match value.to_str() {
                Ok(val_str) if val_str.len() <= MAX_VALUE_LEN => {
                    map.entry(&name_str, &val_str);
                }
                // Visible-ASCII only, so any byte index is a char boundary.
                Ok(val_str) => {
                    map.entry(
                        &name_str,
                        &format!("{}... ({} bytes)", &val_str[..MAX_VALUE_LEN], val_str.len()),
                    );
                }
                Err(_) => {
                    map.entry(&name_str, &format!("<binary: {} bytes>", value.len()));
                }
            }
        }

        map.finish()
    }
}
