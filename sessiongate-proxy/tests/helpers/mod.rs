//! Test helpers for SessionGate integration tests.
//!
//! - An in-process gateway bound to an ephemeral port
//! - A slow streaming upstream for chunk-timing checks
//! - Fixtures shared by the dispatch tests

#![allow(unused_imports)] // Re-exports may not be used by all test files
#![allow(dead_code)]

pub mod gateway;
pub mod slow_upstream;

pub use gateway::*;
pub use slow_upstream::*;

pub const COMPLETION_PATH: &str = "/api/organizations/org-1/chat_conversations/conv-1/completion";

pub const CLIENT_IP: &str = "203.0.113.7";

pub const ACCOUNT_EMAIL: &str = "user@example.com";

pub const RATE_LIMITED_BODY: &str =
    r#"{"error":{"message":"{\"resetsAt\":1700000000,\"remaining\":0}"}}"#;
