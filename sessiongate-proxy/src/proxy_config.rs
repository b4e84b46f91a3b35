//! Socket and connection-pool tuning for the proxy.

use sessiongate_core::config::parse_env_warn;

/// Runtime tuning for the listener and the upstream client.
///
/// All parameters can be overridden via environment variables. There is no
/// stream timeout: completions relay for as long as upstream keeps sending.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Enable TCP_NODELAY on accepted and upstream sockets
    pub tcp_nodelay: bool,

    /// TCP keepalive interval in seconds
    pub tcp_keepalive_secs: u64,

    /// Maximum concurrent connections served; excess gets 503
    pub max_concurrent_streams: usize,

    /// Socket buffer size (SO_RCVBUF / SO_SNDBUF)
    pub socket_buffer_size: usize,

    /// Maximum idle upstream connections kept per host
    pub pool_max_idle_per_host: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_keepalive_secs: 60,
            max_concurrent_streams: 10000,
            socket_buffer_size: 262144, // 256 KB
            pool_max_idle_per_host: 128,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// # Environment Variables
    ///
    /// - `SESSIONGATE_TCP_NODELAY` (default: true)
    /// - `SESSIONGATE_TCP_KEEPALIVE_SECS` (default: 60)
    /// - `SESSIONGATE_MAX_CONCURRENT_STREAMS` (default: 10000)
    /// - `SESSIONGATE_SOCKET_BUFFER_SIZE` (default: 262144)
    /// - `SESSIONGATE_POOL_MAX_IDLE` (default: 128)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            tcp_nodelay: parse_env_warn("SESSIONGATE_TCP_NODELAY", default.tcp_nodelay),

            tcp_keepalive_secs: parse_env_warn(
                "SESSIONGATE_TCP_KEEPALIVE_SECS",
                default.tcp_keepalive_secs,
            ),

            max_concurrent_streams: parse_env_warn(
                "SESSIONGATE_MAX_CONCURRENT_STREAMS",
                default.max_concurrent_streams,
            ),

            socket_buffer_size: parse_env_warn(
                "SESSIONGATE_SOCKET_BUFFER_SIZE",
                default.socket_buffer_size,
            ),

            pool_max_idle_per_host: parse_env_warn(
                "SESSIONGATE_POOL_MAX_IDLE",
                default.pool_max_idle_per_host,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert!(config.tcp_nodelay);
        assert_eq!(config.tcp_keepalive_secs, 60);
        assert_eq!(config.max_concurrent_streams, 10000);
        assert_eq!(config.socket_buffer_size, 262144);
        assert_eq!(config.pool_max_idle_per_host, 128);
    }

    #[test]
    #[serial_test::serial]
    fn test_config_env_loading() {
        unsafe {
            std::env::set_var("SESSIONGATE_MAX_CONCURRENT_STREAMS", "5000");
            std::env::set_var("SESSIONGATE_TCP_NODELAY", "false");
            std::env::set_var("SESSIONGATE_POOL_MAX_IDLE", "lots");
        }

        let config = ProxyConfig::from_env();
        assert_eq!(config.max_concurrent_streams, 5000);
        assert!(!config.tcp_nodelay);
        // Unparseable value falls back to the default
        assert_eq!(config.pool_max_idle_per_host, 128);

        unsafe {
            std::env::remove_var("SESSIONGATE_MAX_CONCURRENT_STREAMS");
            std::env::remove_var("SESSIONGATE_TCP_NODELAY");
            std::env::remove_var("SESSIONGATE_POOL_MAX_IDLE");
        }
    }
}
