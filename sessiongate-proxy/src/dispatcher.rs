//! Request dispatch.
//!
//! Every inbound request goes through [`Dispatcher::dispatch`]:
//!
//! ```text
//! classify path ─┬─ DirectLogin ─► LoginFlow::direct_login
//!                ├─ Login ───────► LoginFlow::oauth_login
//!                ├─ Completion ──► AuthGuard ─► Forwarder ─┬─ 429 ─► RateLimitTracker
//!                │                                         └─ else ─► relay
//!                └─ Default ─────► Forwarder ─► relay
//! ```
//!
//! Handlers return `ProxyResult`. The dispatcher is the single place where an
//! error leaves the pipeline: it is logged with the route, method and path,
//! counted, and handed back to the connection host as an
//! [`UnclassifiedFault`]. The dispatcher itself never renders an error
//! response.

use bytes::Bytes;
use http_body::Body;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use sessiongate_core::auth::{AuthGuard, AuthOutcome};
use sessiongate_core::config::GatewayConfig;
use sessiongate_core::identity::ClientIdentity;
use sessiongate_core::quota::QuotaBookkeeper;
use sessiongate_core::route::{RouteClass, RouteTable};
use sessiongate_core::storage::SessionStore;
use sessiongate_core::telemetry::GatewayMetrics;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, error};

use crate::error::{ProxyError, ProxyResult, UnclassifiedFault};
use crate::forwarder::{Forwarder, UnifiedBody, strip_accept_encoding};
use crate::login::{CookieLogin, LoginFlow, LoginRequest};
use crate::proxy_config::ProxyConfig;
use crate::rate_limit::RateLimitTracker;

/// Largest login body accepted.
pub const LOGIN_BODY_MAX: usize = 16 * 1024;

/// Routes requests to their handlers. Cheap to clone; one per connection.
#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<GatewayConfig>,
    routes: &'static RouteTable,
    auth: AuthGuard,
    forwarder: Forwarder,
    tracker: RateLimitTracker,
    login: Arc<dyn LoginFlow>,
    metrics: Arc<GatewayMetrics>,
}

impl Dispatcher {
    /// Build a dispatcher with the default cookie login flow.
    ///
    /// # Errors
    ///
    /// Fails if the upstream client cannot be constructed.
    pub fn new(
        config: Arc<GatewayConfig>,
        store: Arc<dyn SessionStore>,
        proxy_config: &ProxyConfig,
        metrics: Arc<GatewayMetrics>,
    ) -> ProxyResult<Self> {
        let forwarder = Forwarder::new(config.upstream_url(), proxy_config, metrics.clone())?;
        let tracker = RateLimitTracker::new(
            QuotaBookkeeper::new(store.clone()),
            config.rate_limit_body_max(),
            metrics.clone(),
        );
        let login = Arc::new(CookieLogin::new(
            store,
            config.session_cookie(),
            config.cookie_max_age(),
            config.share_url().clone(),
            metrics.clone(),
        ));

        Ok(Self {
            auth: AuthGuard::new(config.session_cookie()),
            routes: RouteTable::global(),
            config,
            forwarder,
            tracker,
            login,
            metrics,
        })
    }

    /// Replace the login flow.
    pub fn with_login_flow(mut self, login: Arc<dyn LoginFlow>) -> Self {
        self.login = login;
        self
    }

    /// Classify and handle one request.
    ///
    /// # Errors
    ///
    /// Any handler failure, wrapped with the route it came from.
    pub async fn dispatch<B>(
        &self,
        req: Request<B>,
    ) -> Result<Response<UnifiedBody>, UnclassifiedFault>
    where
        B: Body<Data = Bytes> + Send + Sync + Unpin + 'static,
        B::Error: std::fmt::Display + Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let route = self.routes.classify(req.uri().path());
        self.metrics.record_request(route);

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!(route = %route, method = %method, path = %path, "Dispatching");

        let result = match route {
            RouteClass::DirectLogin | RouteClass::Login => self.handle_login(req, route).await,
            RouteClass::Completion => self.handle_completion(req).await,
            RouteClass::Default => self.handle_default(req).await,
        };

        result.map_err(|e| {
            error!(
                route = %route,
                method = %method,
                path = %path,
                error = %e,
                "Request failed"
            );
            self.metrics.record_fault(route);
            UnclassifiedFault::new(route, e)
        })
    }

    async fn handle_completion<B>(&self, mut req: Request<B>) -> ProxyResult<Response<UnifiedBody>>
    where
        B: Body<Data = Bytes> + Send + Sync + Unpin + 'static,
        B::Error: std::fmt::Display,
    {
        let route = RouteClass::Completion;

        let credential = match self.auth.check(req.headers()) {
            AuthOutcome::Authenticated(credential) => credential,
            AuthOutcome::Rejected(response) => {
                self.metrics.record_auth_rejection();
                debug!(path = %req.uri().path(), "Completion without session rejected");
                return Ok(full_response(response));
            }
        };

        let identity = ClientIdentity::from_headers(req.headers(), self.config.identity_header());
        debug!(
            username = %credential,
            identity = ?identity.as_ref().map(ClientIdentity::as_str),
            "Completion authenticated"
        );

        // A 429 body has to be readable for quota bookkeeping.
        strip_accept_encoding(&mut req);
        let response = self.forwarder.forward(req, route).await?;
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return self.tracker.handle(response, identity.as_ref(), route).await;
        }
        Ok(self.forwarder.relay(response, route))
    }

    async fn handle_default<B>(&self, req: Request<B>) -> ProxyResult<Response<UnifiedBody>>
    where
        B: Body<Data = Bytes> + Send + Sync + Unpin + 'static,
        B::Error: std::fmt::Display,
    {
        let route = RouteClass::Default;
        let response = self.forwarder.forward(req, route).await?;
        Ok(self.forwarder.relay(response, route))
    }

    async fn handle_login<B>(
        &self,
        req: Request<B>,
        route: RouteClass,
    ) -> ProxyResult<Response<UnifiedBody>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let identity = ClientIdentity::from_headers(req.headers(), self.config.identity_header());
        let (parts, body) = req.into_parts();
        let body = Limited::new(body, LOGIN_BODY_MAX)
            .collect()
            .await
            .map_err(|e| ProxyError::RequestBody(e.to_string()))?
            .to_bytes();

        let login_req = LoginRequest {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            identity,
        };

        let response = match route {
            RouteClass::Login => self.login.oauth_login(login_req).await?,
            _ => self.login.direct_login(login_req).await?,
        };
        Ok(full_response(response))
    }
}

/// Box a fully-built response into the relay body type.
pub fn full_response(response: Response<Bytes>) -> Response<UnifiedBody> {
    response.map(|body| {
        Full::new(body)
            .map_err(|never| -> ProxyError { match never {} })
            .boxed()
    })
}

impl Service<Request<Incoming>> for Dispatcher {
    type Response = Response<UnifiedBody>;
    type Error = UnclassifiedFault;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let dispatcher = self.clone();
        Box::pin(async move { dispatcher.dispatch(req).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use http::Method;
    use prometheus_client::registry::Registry;
    use sessiongate_core::auth::NOT_LOGGED_IN_BODY;
    use sessiongate_core::storage::MemoryStore;

    struct FailingLogin;

    #[async_trait]
    impl LoginFlow for FailingLogin {
        async fn direct_login(&self, _req: LoginRequest) -> ProxyResult<Response<Bytes>> {
            Err(ProxyError::Storage(
                sessiongate_core::storage::StorageError::Backend("down".into()),
            ))
        }

        async fn oauth_login(&self, _req: LoginRequest) -> ProxyResult<Response<Bytes>> {
            Ok(Response::new(Bytes::from_static(b"oauth")))
        }
    }

    // Port 9 (discard) on loopback: nothing listens, so any upstream call fails.
    fn dispatcher() -> Dispatcher {
        let config = Arc::new(GatewayConfig::new("http://127.0.0.1:9").unwrap());
        let metrics = Arc::new(GatewayMetrics::new(&mut Registry::default()));
        Dispatcher::new(
            config,
            Arc::new(MemoryStore::new()),
            &ProxyConfig::default(),
            metrics,
        )
        .unwrap()
    }

    fn empty(method: Method, uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_completion_without_cookie_is_rejected_locally() {
        let dispatcher = dispatcher();
        let resp = dispatcher
            .dispatch(empty(
                Method::POST,
                "/api/organizations/org/chat_conversations/conv/completion",
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()["content-type"], "application/json");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, NOT_LOGGED_IN_BODY.as_bytes());
    }

    #[tokio::test]
    async fn test_upstream_failure_becomes_fault() {
        let dispatcher = dispatcher();
        let fault = dispatcher
            .dispatch(empty(Method::GET, "/api/bootstrap"))
            .await
            .unwrap_err();

        assert_eq!(fault.route, RouteClass::Default);
        assert_eq!(fault.to_response().status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_login_routes_use_login_flow() {
        let dispatcher = dispatcher().with_login_flow(Arc::new(FailingLogin));

        let resp = dispatcher
            .dispatch(empty(Method::GET, "/login_oauth?username=alice"))
            .await
            .unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "oauth");

        let fault = dispatcher
            .dispatch(empty(Method::POST, "/login"))
            .await
            .unwrap_err();
        assert_eq!(fault.route, RouteClass::DirectLogin);
        assert!(matches!(fault.source, ProxyError::Storage(_)));
    }

    #[tokio::test]
    async fn test_login_body_limit() {
        let dispatcher = dispatcher();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/login")
            .body(Full::new(Bytes::from(vec![b'a'; LOGIN_BODY_MAX + 1])))
            .unwrap();

        let fault = dispatcher.dispatch(req).await.unwrap_err();
        assert!(matches!(fault.source, ProxyError::RequestBody(_)));
        assert_eq!(fault.to_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_full_response_keeps_status_and_headers() {
        let resp = Response::builder()
            .status(StatusCode::CREATED)
            .header("x-test", "1")
            .body(Bytes::from_static(b"ok"))
            .unwrap();
        let boxed = full_response(resp);
        assert_eq!(boxed.status(), StatusCode::CREATED);
        assert_eq!(boxed.headers()["x-test"], "1");
    }
}
