//! Prometheus metrics using prometheus-client crate.
//!
//! [`GatewayMetrics`] registers every counter, histogram and gauge the
//! gateway exports. Metrics are encoded in OpenMetrics text format by the
//! admin server.
//!
//! All label values come from closed sets (route class labels, HTTP status
//! codes, quota outcome labels), so no cardinality limiting is applied.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::route::RouteClass;

// ─────────────────────────────────────────────────────────────────────────────
// Label Sets (prometheus-client requires #[derive(EncodeLabelSet)])
// ─────────────────────────────────────────────────────────────────────────────

/// Labels keyed on route class only.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
    /// Route class label (e.g., "completion", "default")
    pub route: String,
}

/// Labels for upstream response counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpstreamLabels {
    pub route: String,
    /// HTTP status code as string
    pub status_code: String,
}

/// Labels for quota bookkeeping counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QuotaLabels {
    /// Bookkeeping outcome (e.g., "recorded", "unknown_identity")
    pub outcome: String,
}

/// Labels for login counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LoginLabels {
    /// "direct" or "oauth"
    pub flow: String,
    /// "success" or "rejected"
    pub outcome: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Histogram Bucket Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Upstream time-to-headers buckets in milliseconds.
const UPSTREAM_BUCKETS: &[f64] = &[
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
];

// ─────────────────────────────────────────────────────────────────────────────
// GatewayMetrics
// ─────────────────────────────────────────────────────────────────────────────

/// Prometheus metrics for the gateway. Every name carries the `sessiongate_` prefix.
pub struct GatewayMetrics {
    /// Inbound requests by route class.
    pub requests_total: Family<RouteLabels, Counter>,

    /// Upstream responses by route class and status code.
    pub upstream_responses_total: Family<UpstreamLabels, Counter>,

    /// Completion requests rejected for lack of a session.
    pub auth_rejections_total: Counter,

    /// Quota bookkeeping outcomes for upstream 429s.
    pub quota_updates_total: Family<QuotaLabels, Counter>,

    /// Login attempts by flow and outcome.
    pub logins_total: Family<LoginLabels, Counter>,

    /// Faults surfaced at the dispatch boundary, by route class.
    pub faults_total: Family<RouteLabels, Counter>,

    /// Response body bytes relayed from upstream to clients.
    pub relayed_bytes_total: Counter,

    /// Relayed bodies dropped before upstream finished.
    pub client_disconnects_total: Counter,

    /// Upstream latency to response headers, in milliseconds.
    pub upstream_duration_ms: Family<RouteLabels, Histogram>,

    /// Response bodies currently being relayed.
    pub streams_active: Gauge,

    /// Process uptime in seconds, refreshed on scrape.
    pub uptime_seconds: Gauge,
}

impl GatewayMetrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RouteLabels, Counter>::default();
        registry.register(
            "sessiongate_requests_total",
            "Inbound requests by route class",
            requests_total.clone(),
        );

        let upstream_responses_total = Family::<UpstreamLabels, Counter>::default();
        registry.register(
            "sessiongate_upstream_responses_total",
            "Upstream responses by route class and status code",
            upstream_responses_total.clone(),
        );

        let auth_rejections_total = Counter::default();
        registry.register(
            "sessiongate_auth_rejections_total",
            "Completion requests rejected without a session",
            auth_rejections_total.clone(),
        );

        let quota_updates_total = Family::<QuotaLabels, Counter>::default();
        registry.register(
            "sessiongate_quota_updates_total",
            "Quota bookkeeping outcomes for upstream 429 responses",
            quota_updates_total.clone(),
        );

        let logins_total = Family::<LoginLabels, Counter>::default();
        registry.register(
            "sessiongate_logins_total",
            "Login attempts by flow and outcome",
            logins_total.clone(),
        );

        let faults_total = Family::<RouteLabels, Counter>::default();
        registry.register(
            "sessiongate_faults_total",
            "Faults surfaced at the dispatch boundary",
            faults_total.clone(),
        );

        let relayed_bytes_total = Counter::default();
        registry.register(
            "sessiongate_relayed_bytes_total",
            "Response body bytes relayed from upstream",
            relayed_bytes_total.clone(),
        );

        let client_disconnects_total = Counter::default();
        registry.register(
            "sessiongate_client_disconnects_total",
            "Relayed bodies dropped before upstream finished",
            client_disconnects_total.clone(),
        );

        let upstream_duration_ms = Family::<RouteLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(UPSTREAM_BUCKETS.iter().copied())
        });
        registry.register(
            "sessiongate_upstream_duration_ms",
            "Upstream latency to response headers in milliseconds",
            upstream_duration_ms.clone(),
        );

        let streams_active = Gauge::default();
        registry.register(
            "sessiongate_streams_active",
            "Response bodies currently being relayed",
            streams_active.clone(),
        );

        let uptime_seconds = Gauge::default();
        registry.register(
            "sessiongate_uptime_seconds",
            "Process uptime in seconds",
            uptime_seconds.clone(),
        );

        Self {
            requests_total,
            upstream_responses_total,
            auth_rejections_total,
            quota_updates_total,
            logins_total,
            faults_total,
            relayed_bytes_total,
            client_disconnects_total,
            upstream_duration_ms,
            streams_active,
            uptime_seconds,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Convenience Methods
    // ─────────────────────────────────────────────────────────────────────────

    pub fn record_request(&self, route: RouteClass) {
        self.requests_total
            .get_or_create(&route_labels(route))
            .inc();
    }

    /// Record an upstream response and its time to headers.
    pub fn record_upstream_response(&self, route: RouteClass, status: u16, duration_ms: f64) {
        self.upstream_responses_total
            .get_or_create(&UpstreamLabels {
                route: route.as_str().to_string(),
                status_code: status.to_string(),
            })
            .inc();

        self.upstream_duration_ms
            .get_or_create(&route_labels(route))
            .observe(duration_ms);
    }

    pub fn record_auth_rejection(&self) {
        self.auth_rejections_total.inc();
    }

    /// Record a quota bookkeeping outcome label (see `QuotaOutcome::label`).
    pub fn record_quota_outcome(&self, outcome: &str) {
        self.quota_updates_total
            .get_or_create(&QuotaLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub fn record_login(&self, flow: &str, outcome: &str) {
        self.logins_total
            .get_or_create(&LoginLabels {
                flow: flow.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub fn record_fault(&self, route: RouteClass) {
        self.faults_total.get_or_create(&route_labels(route)).inc();
    }
}

fn route_labels(route: RouteClass) -> RouteLabels {
    RouteLabels {
        route: route.as_str().to_string(),
    }
}
