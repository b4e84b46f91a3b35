//! Operational lifecycle management.
//!
//! This module provides:
//! - Lifecycle state tracking for startup and shutdown
//! - Health and readiness probes for the admin port
//! - Graceful shutdown with request draining
//!
//! ## Lifecycle States
//!
//! ```text
//! Starting → Ready → ShuttingDown → Stopped
//! ```
//!
//! - **Starting**: Initialization in progress
//! - **Ready**: Accepting traffic
//! - **ShuttingDown**: Draining, rejecting new requests
//! - **Stopped**: Shutdown complete
//!
//! Open response streams count as active requests, so draining waits for
//! in-flight completions to finish relaying (up to the drain timeout).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::parse_env_warn;

pub mod health;

pub use health::{HealthResponse, ReadinessChecks, ReadinessResponse, health_router};

// ============================================================================
// Lifecycle State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Initialization in progress
    Starting,
    /// Accepting traffic
    Ready,
    /// Draining, rejecting new requests
    ShuttingDown,
    /// Shutdown complete
    Stopped,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Overall shutdown timeout (default: 30s)
    pub shutdown_timeout: Duration,
    /// Request drain timeout (default: 25s, must be < shutdown_timeout)
    pub drain_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(25),
        }
    }
}

impl LifecycleConfig {
    /// Load from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SESSIONGATE_SHUTDOWN_TIMEOUT_SECS` (default: 30)
    /// - `SESSIONGATE_DRAIN_TIMEOUT_SECS` (default: 25)
    ///
    /// A drain timeout that does not leave at least one second before the
    /// shutdown deadline is clamped, with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        let default = Self::default();

        let shutdown_timeout = Duration::from_secs(parse_env_warn(
            "SESSIONGATE_SHUTDOWN_TIMEOUT_SECS",
            default.shutdown_timeout.as_secs(),
        ));
        let drain_timeout = Duration::from_secs(parse_env_warn(
            "SESSIONGATE_DRAIN_TIMEOUT_SECS",
            default.drain_timeout.as_secs(),
        ));

        Self {
            shutdown_timeout,
            drain_timeout: clamp_drain_timeout(drain_timeout, shutdown_timeout),
        }
    }
}

const MIN_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const MIN_POST_DRAIN_BUFFER: Duration = Duration::from_secs(1);

fn clamp_drain_timeout(drain: Duration, shutdown: Duration) -> Duration {
    let max_drain = shutdown
        .saturating_sub(MIN_POST_DRAIN_BUFFER)
        .max(MIN_DRAIN_TIMEOUT);
    let clamped = drain.clamp(MIN_DRAIN_TIMEOUT, max_drain);
    if clamped != drain {
        warn!(
            drain_timeout_secs = drain.as_secs(),
            shutdown_timeout_secs = shutdown.as_secs(),
            adjusted_drain_secs = clamped.as_secs(),
            "drain_timeout out of range, adjusting"
        );
    }
    clamped
}

// ============================================================================
// Lifecycle Manager
// ============================================================================

/// Coordinates startup, readiness and shutdown.
///
/// All state is atomic or swapped through `ArcSwap`; the manager is shared
/// by `Arc` between the accept loop, the admin server and request guards.
pub struct LifecycleManager {
    state: ArcSwap<LifecycleState>,
    started_at: Instant,
    shutdown_token: CancellationToken,
    active_requests: AtomicUsize,
    config_loaded: AtomicBool,
    store_ready: AtomicBool,
    config: LifecycleConfig,
    version: &'static str,
}

impl LifecycleManager {
    /// The manager starts in the `Starting` state.
    #[must_use]
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            state: ArcSwap::new(Arc::new(LifecycleState::Starting)),
            started_at: Instant::now(),
            shutdown_token: CancellationToken::new(),
            active_requests: AtomicUsize::new(0),
            config_loaded: AtomicBool::new(false),
            store_ready: AtomicBool::new(false),
            config,
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), LifecycleState::Ready)
    }

    /// Returns true if the service is shutting down or stopped.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::ShuttingDown | LifecycleState::Stopped
        )
    }

    pub fn mark_ready(&self) {
        self.state.store(Arc::new(LifecycleState::Ready));
        info!(
            version = %self.version,
            startup_duration_ms = self.started_at.elapsed().as_millis(),
            "SessionGate ready"
        );
    }

    pub fn mark_config_loaded(&self) {
        self.config_loaded.store(true, Ordering::SeqCst);
    }

    /// Mark the session store as connected and usable.
    pub fn mark_store_ready(&self, backend: &str) {
        self.store_ready.store(true, Ordering::SeqCst);
        info!(backend = %backend, "Session store ready");
    }

    /// Returns a clone of the shutdown token.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Set state to ShuttingDown and cancel the shutdown token.
    pub fn begin_shutdown(&self) {
        self.state.store(Arc::new(LifecycleState::ShuttingDown));
        self.shutdown_token.cancel();
        info!(
            active_requests = self.active_requests.load(Ordering::SeqCst),
            "Shutdown initiated"
        );
    }

    /// Track an active request (returns RAII guard).
    ///
    /// Returns `None` once shutdown has begun. The guard decrements the
    /// counter when dropped, including on panic.
    #[must_use]
    pub fn track_request(self: &Arc<Self>) -> Option<RequestGuard> {
        if self.is_shutting_down() {
            return None;
        }
        self.active_requests.fetch_add(1, Ordering::SeqCst);
        Some(RequestGuard {
            manager: Arc::clone(self),
        })
    }

    #[must_use]
    pub fn active_request_count(&self) -> usize {
        self.active_requests.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    #[must_use]
    pub fn version(&self) -> &'static str {
        self.version
    }

    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    #[must_use]
    pub fn readiness_checks(&self) -> ReadinessChecks {
        ReadinessChecks {
            config_loaded: self.config_loaded.load(Ordering::SeqCst),
            store_ready: self.store_ready.load(Ordering::SeqCst),
        }
    }

    /// Wait for active requests to finish, polling every 100ms.
    pub async fn drain_requests(&self) -> DrainResult {
        let deadline = Instant::now() + self.config.drain_timeout;
        let mut last_log = Instant::now();

        loop {
            let active = self.active_requests.load(Ordering::SeqCst);

            if active == 0 {
                return DrainResult::Complete;
            }

            if Instant::now() > deadline {
                warn!(
                    active_requests = active,
                    "Drain timeout exceeded, forcing shutdown"
                );
                return DrainResult::Timeout { remaining: active };
            }

            if last_log.elapsed() >= Duration::from_secs(5) {
                info!(active_requests = active, "Draining requests...");
                last_log = Instant::now();
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub fn mark_stopped(&self) {
        self.state.store(Arc::new(LifecycleState::Stopped));
    }
}

// ============================================================================
// Request Guard
// ============================================================================

/// RAII guard for request tracking.
///
/// Holds an `Arc` to the manager so it can move into spawned connection
/// tasks and into response bodies.
pub struct RequestGuard {
    manager: Arc<LifecycleManager>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.manager.active_requests.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    /// All requests completed before timeout
    Complete,
    /// Timeout reached with remaining requests
    Timeout {
        /// Number of requests still active
        remaining: usize,
    },
}
