//! SessionGate - edge reverse proxy for a chat-completion API.
//!
//! Gates the completion endpoint behind a session cookie, relays every
//! response from the configured upstream as a live stream, and records quota
//! state when upstream answers a completion with 429.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto;
use sessiongate_core::config::GatewayConfig;
use sessiongate_core::lifecycle::{DrainResult, LifecycleConfig, LifecycleManager};
use sessiongate_core::storage::{MemoryStore, SessionStore};
use sessiongate_core::telemetry::GatewayMetrics;
use sessiongate_proxy::admin::AdminServer;
use sessiongate_proxy::dispatcher::Dispatcher;
use sessiongate_proxy::error::UnclassifiedFault;
use sessiongate_proxy::logging_layer::logging_layer;
use sessiongate_proxy::ports::{admin_port, listen_port};
use sessiongate_proxy::proxy_config::ProxyConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tracing::{debug, error, info, warn};

/// Command-line options.
///
/// | Port | Env Variable | Default | Purpose |
/// |------|--------------|---------|---------|
/// | 8787 | SESSIONGATE_LISTEN_PORT | 8787 | Client traffic → upstream |
/// | 8788 | SESSIONGATE_ADMIN_PORT | 8788 | Health checks and metrics |
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Bind address for client traffic
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Upstream base URL, e.g. "https://api.example.com"
    #[arg(long, env = "SESSIONGATE_UPSTREAM_URL")]
    upstream_url: Option<String>,

    /// Redis URL for the session store; in-process storage when unset
    #[cfg(feature = "redis-storage")]
    #[arg(long, env = "SESSIONGATE_REDIS_URL")]
    redis_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The guard flushes buffered log lines on exit; keep it for the whole run.
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .json()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let proxy_config = ProxyConfig::from_env();

    let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::from_env()));

    let gateway_config = match GatewayConfig::from_env(cli.upstream_url.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "Invalid configuration, refusing to start");
            return Err(e.into());
        }
    };
    lifecycle.mark_config_loaded();
    info!(
        upstream = %gateway_config.upstream_url(),
        share_url = %gateway_config.share_url(),
        session_cookie = gateway_config.session_cookie(),
        identity_header = %gateway_config.identity_header(),
        cookie_max_age_secs = gateway_config.cookie_max_age().as_secs(),
        "Configuration loaded"
    );

    let mut prom_registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(GatewayMetrics::new(&mut prom_registry));
    let prom_registry = Arc::new(prom_registry);

    let store = open_store(&cli).await?;
    lifecycle.mark_store_ready(store.backend());

    let shutdown = lifecycle.shutdown_token();
    setup_signal_handlers(lifecycle.clone());

    let admin = AdminServer::new(lifecycle.clone(), prom_registry).with_metrics(metrics.clone());
    let admin_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = admin.run(admin_shutdown).await {
            error!(error = %e, "Admin server error");
        }
    });

    let dispatcher = Dispatcher::new(gateway_config, store, &proxy_config, metrics)?;
    let service_stack = ServiceBuilder::new()
        .layer(logging_layer())
        .service(dispatcher);

    let addr: SocketAddr = format!("{}:{}", cli.bind, listen_port()).parse()?;
    let listener = TcpListener::bind(addr).await?;
    let semaphore = Arc::new(Semaphore::new(proxy_config.max_concurrent_streams));

    lifecycle.mark_ready();
    info!(
        listen = %addr,
        admin_port = admin_port(),
        max_concurrent_streams = proxy_config.max_concurrent_streams,
        "SessionGate ready"
    );

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let request_guard = match lifecycle.track_request() {
                            Some(guard) => guard,
                            None => {
                                warn!(peer = %peer_addr, "Rejected connection: shutting down");
                                tokio::spawn(async move {
                                    let _ =
                                        send_503(stream, "SessionGate is shutting down.", 5).await;
                                });
                                continue;
                            }
                        };

                        let permit = match semaphore.clone().try_acquire_owned() {
                            Ok(p) => p,
                            Err(_) => {
                                warn!(
                                    peer = %peer_addr,
                                    max_streams = proxy_config.max_concurrent_streams,
                                    "Rejected connection: max concurrent streams reached"
                                );
                                drop(request_guard);
                                tokio::spawn(async move {
                                    let _ = send_503(
                                        stream,
                                        "SessionGate has reached its connection limit.",
                                        1,
                                    )
                                    .await;
                                });
                                continue;
                            }
                        };

                        if let Err(e) = configure_tcp_stream(&stream, &proxy_config) {
                            error!(error = %e, "Failed to configure socket");
                        }

                        let service_stack = service_stack.clone();
                        let conn_shutdown = shutdown.clone();
                        let grace = lifecycle.config().drain_timeout;

                        tokio::spawn(async move {
                            handle_connection(
                                stream,
                                peer_addr,
                                service_stack,
                                conn_shutdown,
                                grace,
                            )
                            .await;
                            drop(request_guard);
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }

            _ = shutdown.cancelled() => {
                info!("Shutdown signal received, stopping new connections");
                break;
            }
        }
    }

    info!(
        active_requests = lifecycle.active_request_count(),
        drain_timeout_secs = lifecycle.config().drain_timeout.as_secs(),
        "Waiting for active connections to drain"
    );
    let drain_result = lifecycle.drain_requests().await;
    lifecycle.mark_stopped();

    match drain_result {
        DrainResult::Complete => {
            info!("All connections drained, shutting down cleanly");
            Ok(())
        }
        DrainResult::Timeout { remaining } => Err(format!(
            "Drain timeout exceeded with {} remaining connections",
            remaining
        )
        .into()),
    }
}

/// Open the configured session store.
#[cfg_attr(not(feature = "redis-storage"), allow(unused_variables))]
async fn open_store(cli: &Cli) -> Result<Arc<dyn SessionStore>, Box<dyn std::error::Error>> {
    #[cfg(feature = "redis-storage")]
    {
        if let Some(url) = &cli.redis_url {
            let store = sessiongate_core::storage::RedisStore::connect(url).await?;
            info!(backend = store.backend(), "Session store connected");
            return Ok(Arc::new(store));
        }
    }

    warn!(
        backend = "memory",
        "Using in-process session store; bindings and quota records are lost on restart"
    );
    Ok(Arc::new(MemoryStore::new()))
}

/// SIGINT and SIGTERM begin graceful shutdown through the lifecycle token.
fn setup_signal_handlers(lifecycle: Arc<LifecycleManager>) {
    let lifecycle_sigint = lifecycle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                lifecycle_sigint.begin_shutdown();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    {
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    lifecycle.begin_shutdown();
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGTERM");
                }
            }
        });
    }

    #[cfg(not(unix))]
    let _ = lifecycle;
}

/// Serve one connection until it closes or shutdown asks it to.
///
/// Dispatch faults are rendered here; this is the only place an
/// [`UnclassifiedFault`] becomes an HTTP response.
async fn handle_connection<S, B>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    service: S,
    shutdown: CancellationToken,
    grace: Duration,
) where
    S: tower::Service<Request<Incoming>, Response = Response<B>, Error = UnclassifiedFault>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: http_body::Body<Data = bytes::Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let io = TokioIo::new(stream);

    let svc_fn = hyper::service::service_fn(move |req| {
        let mut svc = service.clone();
        async move {
            let result: Result<_, std::convert::Infallible> = match svc.call(req).await {
                Ok(response) => Ok(response.map(|body| {
                    body.map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.into() })
                        .boxed()
                })),
                Err(fault) => Ok(fault
                    .to_response()
                    .map(|body| body.map_err(|e| match e {}).boxed())),
            };
            result
        }
    });

    let builder = auto::Builder::new(hyper_util::rt::TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(io, svc_fn);
    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => {
            if let Err(e) = result {
                debug!(peer = %peer_addr, error = %e, "Connection closed with error");
            }
        }
        _ = shutdown.cancelled() => {
            debug!(peer = %peer_addr, "Gracefully closing connection");
            conn.as_mut().graceful_shutdown();
            if tokio::time::timeout(grace, conn).await.is_err() {
                warn!(peer = %peer_addr, "Connection still streaming at shutdown, dropping");
            }
        }
    }
}

/// Apply socket options from [`ProxyConfig`].
fn configure_tcp_stream(stream: &TcpStream, config: &ProxyConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    let socket = socket2::SockRef::from(stream);
    let keepalive =
        socket2::TcpKeepalive::new().with_time(Duration::from_secs(config.tcp_keepalive_secs));
    socket.set_tcp_keepalive(&keepalive)?;
    socket.set_recv_buffer_size(config.socket_buffer_size)?;
    socket.set_send_buffer_size(config.socket_buffer_size)?;

    Ok(())
}

/// Write a minimal 503 and close, without involving hyper.
async fn send_503(
    mut stream: TcpStream,
    reason: &str,
    retry_after_secs: u64,
) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = format!("503 Service Unavailable\n\n{reason}\nPlease retry in a moment.");
    let response = format!(
        "HTTP/1.1 503 Service Unavailable\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         Retry-After: {}\r\n\
         \r\n\
         {}",
        body.len(),
        retry_after_secs,
        body
    );

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
