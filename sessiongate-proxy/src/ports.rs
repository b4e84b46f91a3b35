//! Listener port configuration.
//!
//! | Port | Name | Purpose |
//! |------|------|---------|
//! | 8787 | Listen | Client traffic → upstream (main proxy) |
//! | 8788 | Admin | Health checks and metrics |
//!
//! # Environment Variables
//!
//! - `SESSIONGATE_LISTEN_PORT` (default: 8787)
//! - `SESSIONGATE_ADMIN_PORT` (default: 8788)

/// Default port for proxied client traffic.
pub const DEFAULT_LISTEN_PORT: u16 = 8787;

/// Default admin port.
///
/// Endpoints served on this port:
/// - `GET /health` - Liveness probe
/// - `GET /ready` - Readiness probe
/// - `GET /metrics` - Prometheus metrics
pub const DEFAULT_ADMIN_PORT: u16 = 8788;

/// Get the listen port from environment or default.
///
/// # Example
///
/// ```rust
/// use sessiongate_proxy::ports::listen_port;
///
/// let port = listen_port();
/// assert!(port > 0);
/// ```
pub fn listen_port() -> u16 {
    port_from_env("SESSIONGATE_LISTEN_PORT", DEFAULT_LISTEN_PORT)
}

/// Get the admin port from environment or default.
pub fn admin_port() -> u16 {
    port_from_env("SESSIONGATE_ADMIN_PORT", DEFAULT_ADMIN_PORT)
}

fn port_from_env(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|p| *p > 0)
        .unwrap_or(default)
}
