//! In-process gateway for integration tests.
//!
//! Serves a [`Dispatcher`] behind the same tracing layer and fault rendering
//! as the binary, on `127.0.0.1:0`.

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use prometheus_client::registry::Registry;
use sessiongate_core::config::GatewayConfig;
use sessiongate_core::identity::ClientIdentity;
use sessiongate_core::storage::{MemoryStore, SessionStore};
use sessiongate_core::telemetry::GatewayMetrics;
use sessiongate_proxy::dispatcher::Dispatcher;
use sessiongate_proxy::logging_layer::logging_layer;
use sessiongate_proxy::proxy_config::ProxyConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::{Service, ServiceBuilder};

/// Running gateway plus handles to its shared state.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub store: Arc<MemoryStore>,
    pub metrics: Arc<GatewayMetrics>,
    pub registry: Arc<Registry>,
    task: tokio::task::JoinHandle<()>,
}

impl TestGateway {
    /// Start a gateway in front of `upstream` with an empty memory store.
    pub async fn start(upstream: &str) -> Self {
        Self::start_with_store(upstream, Arc::new(MemoryStore::new())).await
    }

    pub async fn start_with_store(upstream: &str, store: Arc<MemoryStore>) -> Self {
        let config = Arc::new(GatewayConfig::new(upstream).expect("valid upstream"));
        let mut registry = Registry::default();
        let metrics = Arc::new(GatewayMetrics::new(&mut registry));
        let dyn_store: Arc<dyn SessionStore> = store.clone();

        let dispatcher =
            Dispatcher::new(config, dyn_store, &ProxyConfig::default(), metrics.clone())
                .expect("dispatcher");
        let service = ServiceBuilder::new().layer(logging_layer()).service(dispatcher);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let service = service.clone();
                tokio::spawn(async move {
                    let svc_fn = hyper::service::service_fn(move |req: Request<Incoming>| {
                        let mut svc = service.clone();
                        async move {
                            let result: Result<_, std::convert::Infallible> =
                                match svc.call(req).await {
                                    Ok(response) => Ok(response.map(|body| body.boxed())),
                                    Err(fault) => Ok(fault.to_response().map(|body| {
                                        body.map_err(|never| match never {}).boxed()
                                    })),
                                };
                            result
                        }
                    });
                    let _ = auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), svc_fn)
                        .await;
                });
            }
        });

        Self {
            addr,
            store,
            metrics,
            registry: Arc::new(registry),
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Bind the test client address to an account email.
    pub fn bind(&self, ip: &str, email: &str) {
        self.store.insert_binding(&ClientIdentity::new(ip), email);
    }

    /// Current metrics in OpenMetrics text form.
    pub fn metrics_text(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry).expect("encode");
        buffer
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// HTTP client that never follows redirects.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("reqwest client")
}
