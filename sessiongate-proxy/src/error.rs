//! Error types for the SessionGate HTTP proxy layer.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use sessiongate_core::route::RouteClass;
use sessiongate_core::storage::StorageError;
use thiserror::Error;

/// Errors that can occur while serving a request.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Invalid URI or target
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// Connection error to upstream (maps to 502 Bad Gateway)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connection refused by upstream (maps to 502 Bad Gateway)
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Upstream connect or handshake timed out at the OS/TLS level (504)
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Upstream failed mid-body
    #[error("Upstream body error: {0}")]
    UpstreamBody(String),

    /// Inbound request body could not be read
    #[error("Request body error: {0}")]
    RequestBody(String),

    /// Outbound request or response could not be assembled
    #[error("Failed to build HTTP message: {0}")]
    Build(#[from] http::Error),

    /// Session store failure outside quota bookkeeping
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A locally built JSON body could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProxyError {
    /// Convert error to a plain-text HTTP response.
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        let (status, message) = match self {
            ProxyError::ConnectionRefused(_)
            | ProxyError::Connection(_)
            | ProxyError::UpstreamBody(_) => (
                StatusCode::BAD_GATEWAY,
                "502 Bad Gateway\n\nFailed to connect to upstream server.",
            ),
            ProxyError::Timeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "504 Gateway Timeout\n\nUpstream server did not respond in time.",
            ),
            ProxyError::InvalidUri(_) => (
                StatusCode::BAD_REQUEST,
                "400 Bad Request\n\nInvalid request URI.",
            ),
            ProxyError::RequestBody(_) => (
                StatusCode::BAD_REQUEST,
                "400 Bad Request\n\nRequest body could not be read.",
            ),
            ProxyError::Build(_) | ProxyError::Storage(_) | ProxyError::Serialization(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "500 Internal Server Error",
            ),
        };

        Response::builder()
            .status(status)
            .header("Content-Type", "text/plain")
            .body(Full::new(Bytes::from(message)))
            .unwrap_or_else(|_| {
                let mut resp = Response::new(Full::new(Bytes::from("500 Internal Server Error")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp
            })
    }
}

/// Result type alias for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// A fault that escaped a route handler, tagged with the route it came from.
///
/// Returned by the dispatcher; the connection host decides how to render it.
#[derive(Error, Debug)]
#[error("{route} route failed: {source}")]
pub struct UnclassifiedFault {
    pub route: RouteClass,
    #[source]
    pub source: ProxyError,
}

impl UnclassifiedFault {
    pub fn new(route: RouteClass, source: ProxyError) -> Self {
        Self { route, source }
    }

    /// Render through the underlying [`ProxyError`].
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        self.source.to_response()
    }
}
