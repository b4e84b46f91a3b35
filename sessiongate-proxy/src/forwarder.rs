//! Upstream forwarding.
//!
//! # Overview
//!
//! [`Forwarder`] rewrites an inbound request onto the configured upstream and
//! sends it through a pooled hyper client:
//!
//! - URI: upstream base URL + original path and query
//! - `Host`: rewritten to the upstream authority
//! - Other headers: copied, minus hop-by-hop headers
//! - Body: streamed through without buffering
//!
//! The response comes back untouched as `Response<Incoming>`; the caller
//! decides whether to relay it ([`Forwarder::relay`]) or inspect it first.
//! There is no request or stream timeout.

use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, HOST};
use http::{HeaderValue, Uri};
use http_body::Body;
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use sessiongate_core::route::RouteClass;
use sessiongate_core::telemetry::GatewayMetrics;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::proxy_config::ProxyConfig;
use crate::relay_body::RelayBody;

/// Body type sent to the upstream client.
pub type ClientBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Body type of every response the gateway returns.
pub type UnifiedBody = http_body_util::combinators::BoxBody<Bytes, ProxyError>;

/// Forwards requests to a single fixed upstream.
#[derive(Clone)]
pub struct Forwarder {
    client: Client<HttpsConnector<HttpConnector>, ClientBody>,
    upstream_base: String,
    upstream_host: HeaderValue,
    metrics: Arc<GatewayMetrics>,
}

impl Forwarder {
    /// Build a forwarder for `upstream` with a TLS-capable pooled client.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::InvalidUri` if `upstream` has no authority, and
    /// `ProxyError::Connection` if the TLS provider or native roots cannot be
    /// loaded.
    pub fn new(
        upstream: &Uri,
        config: &ProxyConfig,
        metrics: Arc<GatewayMetrics>,
    ) -> ProxyResult<Self> {
        let authority = upstream.authority().ok_or_else(|| {
            ProxyError::InvalidUri(format!("Upstream has no authority: {upstream}"))
        })?;
        let upstream_host = HeaderValue::from_str(authority.as_str())
            .map_err(|e| ProxyError::InvalidUri(format!("Upstream authority: {e}")))?;

        // rustls needs a process-wide crypto provider; install it exactly once.
        static RUSTLS_INIT: std::sync::OnceLock<Result<(), ()>> = std::sync::OnceLock::new();
        let init_result = RUSTLS_INIT.get_or_init(|| {
            rustls::crypto::ring::default_provider()
                .install_default()
                .map_err(|_| ())
        });
        if init_result.is_err() && rustls::crypto::CryptoProvider::get_default().is_none() {
            return Err(ProxyError::Connection(
                "Failed to install rustls crypto provider".into(),
            ));
        }

        let mut http_connector = HttpConnector::new();
        http_connector.set_nodelay(config.tcp_nodelay);
        http_connector.enforce_http(false);
        if config.tcp_keepalive_secs > 0 {
            http_connector.set_keepalive(Some(Duration::from_secs(config.tcp_keepalive_secs)));
        }

        let https_connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| ProxyError::Connection(format!("Failed to load native TLS roots: {}", e)))?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .http2_keep_alive_while_idle(true)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(https_connector);

        Ok(Self {
            client,
            upstream_base: upstream.to_string().trim_end_matches('/').to_string(),
            upstream_host,
            metrics,
        })
    }

    /// Upstream URI for an inbound request URI: base + path and query.
    pub fn target_uri(&self, inbound: &Uri) -> ProxyResult<Uri> {
        let path = inbound
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let full_uri = format!("{}{}", self.upstream_base, path);
        full_uri
            .parse()
            .map_err(|e| ProxyError::InvalidUri(format!("Failed to parse upstream URI: {}", e)))
    }

    /// Rewrite an inbound request into an upstream request.
    pub fn build_request<B>(&self, req: Request<B>) -> ProxyResult<Request<ClientBody>>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: std::fmt::Display,
    {
        let target_uri = self.target_uri(req.uri())?;
        let (parts, incoming_body) = req.into_parts();

        let mut upstream_req = Request::builder()
            .method(parts.method)
            .uri(target_uri)
            .version(parts.version);

        let headers = upstream_req.headers_mut().ok_or_else(|| {
            error!("Failed to get mutable headers from request builder");
            ProxyError::InvalidUri("Request builder in invalid state".to_string())
        })?;
        // `HeaderMap::into_iter` yields `None` names for repeated values of
        // the previous header, so track the current name to keep them all.
        let mut current = None;
        for (name_opt, value) in parts.headers {
            if let Some(name) = name_opt {
                current = Some(name);
            }
            if let Some(name) = &current
                && *name != HOST
                && !is_hop_by_hop_header(name.as_str())
            {
                headers.append(name.clone(), value);
            }
        }
        headers.insert(HOST, self.upstream_host.clone());

        let body_stream = BodyStream::new(incoming_body);
        let mapped_stream = body_stream.map(|result| {
            result.map_err(|e| -> Box<dyn std::error::Error + Send + Sync> {
                Box::new(std::io::Error::other(format!("Body stream error: {}", e)))
            })
        });
        let boxed_body: ClientBody = BodyExt::boxed(StreamBody::new(mapped_stream));

        Ok(upstream_req.body(boxed_body)?)
    }

    /// Forward a request and return the upstream response as received.
    pub async fn forward<B>(
        &self,
        req: Request<B>,
        route: RouteClass,
    ) -> ProxyResult<Response<Incoming>>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: std::fmt::Display,
    {
        let upstream_req = self.build_request(req)?;
        debug!(
            route = %route,
            method = %upstream_req.method(),
            target = %upstream_req.uri(),
            "Forwarding to upstream"
        );

        let started = Instant::now();
        let response = self
            .client
            .request(upstream_req)
            .await
            .map_err(map_hyper_error)?;

        self.metrics.record_upstream_response(
            route,
            response.status().as_u16(),
            started.elapsed().as_secs_f64() * 1000.0,
        );
        Ok(response)
    }

    /// Wrap an upstream response for streaming back to the caller.
    ///
    /// Status and headers are kept as-is; the body is relayed frame by frame.
    pub fn relay<B>(&self, response: Response<B>, route: RouteClass) -> Response<UnifiedBody>
    where
        B: Body<Data = Bytes> + Send + Sync + Unpin + 'static,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = response.into_parts();
        let relay = RelayBody::new(body, route).with_metrics(self.metrics.clone());
        Response::from_parts(parts, BodyExt::boxed(relay))
    }
}

/// Drop `Accept-Encoding` so upstream answers with a body we can read.
///
/// Only used where the gateway may inspect the response; everything else
/// keeps the client's negotiation.
pub fn strip_accept_encoding<B>(req: &mut Request<B>) {
    req.headers_mut().remove(ACCEPT_ENCODING);
}

/// The response's content coding, if it is anything but `identity`.
pub fn compressed_encoding<B>(res: &Response<B>) -> Option<&str> {
    res.headers()
        .get(CONTENT_ENCODING)
        .map(|v| v.to_str().unwrap_or("unknown"))
        .filter(|encoding| !encoding.trim().eq_ignore_ascii_case("identity"))
}

/// Check if a header is a hop-by-hop header that shouldn't be forwarded.
///
/// `connection`, `upgrade` and `transfer-encoding` are passed through so
/// chunked bodies and upgrades keep working.
pub fn is_hop_by_hop_header(name: &str) -> bool {
    const HOP_BY_HOP: &[&str] = &[
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
    ];
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Map hyper_util client errors to ProxyError variants.
///
/// - Connection refused -> `ProxyError::ConnectionRefused` (502)
/// - Timeout -> `ProxyError::Timeout` (504)
/// - Other errors -> `ProxyError::Connection` (502)
fn map_hyper_error(e: hyper_util::client::legacy::Error) -> ProxyError {
    let error_msg = format!("{:?}", e).to_lowercase();

    if error_msg.contains("connection refused") || error_msg.contains("connectionrefused") {
        warn!(error = %e, "Upstream connection refused");
        return ProxyError::ConnectionRefused(format!("Upstream refused connection: {}", e));
    }

    if error_msg.contains("timeout") || error_msg.contains("timed out") {
        warn!(error = %e, "Upstream timeout");
        return ProxyError::Timeout(format!("Upstream timeout: {}", e));
    }

    if e.is_connect() {
        warn!(error = %e, "Upstream connection failed");
        return ProxyError::Connection(format!("Failed to connect to upstream: {}", e));
    }

    warn!(error = %e, "Upstream error");
    ProxyError::Connection(format!("Upstream error: {}", e))
}
