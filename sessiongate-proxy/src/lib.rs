//! SessionGate HTTP edge proxy.
//!
//! This crate holds the HTTP side of the gateway: request dispatch, upstream
//! forwarding with streaming relay, 429 interception, the login flows, the
//! admin server and request logging. Routing rules, the session gate, quota
//! parsing and storage live in `sessiongate-core`.

pub mod admin;
pub mod dispatcher;
pub mod error;
pub mod forwarder;
pub mod logging_layer;
pub mod login;
pub mod ports;
pub mod proxy_config;
pub mod rate_limit;
pub mod relay_body;
