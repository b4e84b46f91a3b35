//! SessionGate Core: transport-independent pieces of the session gateway.
//!
//! This library provides route classification, the session gate, client
//! identity extraction, quota bookkeeping for upstream rate limits, session
//! storage, configuration, lifecycle management and metrics. The HTTP
//! plumbing lives in `sessiongate-proxy`.

pub mod auth;
pub mod config;
pub mod identity;
pub mod lifecycle;
pub mod quota;
pub mod route;
pub mod storage;
pub mod telemetry;
