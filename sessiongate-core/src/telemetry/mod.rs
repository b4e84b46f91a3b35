//! Prometheus metrics for the gateway.
//!
//! The proxy crate owns the registry and serves it on the admin port at
//! `/metrics`; everything that records goes through [`GatewayMetrics`].

pub mod prom_metrics;

pub use prom_metrics::GatewayMetrics;
