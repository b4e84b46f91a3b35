//! Quota bookkeeping from upstream rate-limit responses.
//!
//! # Overview
//!
//! When the chat API refuses a completion with HTTP 429 it describes the
//! account's quota inside a doubly-encoded error envelope:
//!
//! ```text
//! {"error": {"message": "{\"resetsAt\":1700000000,\"remaining\":0}"}}
//!                        └──────── JSON encoded as a string ────────┘
//! ```
//!
//! [`QuotaBookkeeper::observe`] decodes both layers, resolves the client
//! identity to an account email and overwrites that account's
//! [`QuotaRecord`]. Every way this can fall short (bad JSON at either layer,
//! no reset time, no identity, unknown identity, storage failure) is reported
//! as a [`QuotaOutcome`] value, never as an error: bookkeeping is best-effort
//! and must not change what the caller receives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::identity::ClientIdentity;
use crate::storage::{SessionStore, StorageError};

/// Account-level quota state inferred from a 429.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub email: String,
    /// Unix timestamp (seconds) at which the quota resets.
    #[serde(rename = "resetsAt")]
    pub resets_at: i64,
    /// Remaining allowance exactly as upstream reported it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<Value>,
}

impl QuotaRecord {
    /// Reset time as a UTC datetime, if the timestamp is in range.
    pub fn resets_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.resets_at, 0)
    }
}

/// Quota fields decoded from the nested error message.
///
/// Both fields are kept as raw JSON: upstream has sent integer, fractional
/// and string timestamps, and a `remaining` of any shape must not stop the
/// reset time from being recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RateLimitDetails {
    #[serde(rename = "resetsAt", default)]
    pub resets_at: Option<Value>,
    #[serde(default)]
    pub remaining: Option<Value>,
}

impl RateLimitDetails {
    /// Reset time in Unix seconds, if `resetsAt` holds a usable one.
    ///
    /// Accepts integers, fractional seconds (truncated), numeric strings and
    /// RFC 3339 strings. Zero, empty and non-timestamp values count as absent.
    pub fn reset_time(&self) -> Option<i64> {
        let seconds = match self.resets_at.as_ref()? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(truncate_seconds)),
            Value::String(s) => parse_timestamp(s),
            _ => None,
        };
        seconds.filter(|t| *t != 0)
    }
}

fn truncate_seconds(value: f64) -> Option<i64> {
    value.is_finite().then(|| value.trunc() as i64)
}

fn parse_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(seconds) = raw.parse::<i64>() {
        return Some(seconds);
    }
    if let Ok(seconds) = raw.parse::<f64>() {
        return truncate_seconds(seconds);
    }
    DateTime::parse_from_rfc3339(raw).ok().map(|t| t.timestamp())
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorPayload,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    message: String,
}

/// Why a 429 body could not be decoded into [`RateLimitDetails`].
#[derive(Debug, Error)]
pub enum QuotaParseError {
    /// Body is not JSON or lacks `error.message` as a string.
    #[error("invalid rate-limit envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    /// `error.message` is not itself a JSON quota object.
    #[error("invalid rate-limit message: {0}")]
    Message(#[source] serde_json::Error),
}

/// Decode a 429 body: outer envelope, then the JSON string in `error.message`.
pub fn parse_rate_limit_body(body: &[u8]) -> Result<RateLimitDetails, QuotaParseError> {
    let envelope: ErrorEnvelope =
        serde_json::from_slice(body).map_err(QuotaParseError::Envelope)?;
    serde_json::from_str(&envelope.error.message).map_err(QuotaParseError::Message)
}

/// What quota bookkeeping did for one 429.
#[derive(Debug)]
pub enum QuotaOutcome {
    /// Record written to the store.
    Recorded(QuotaRecord),
    /// Body could not be decoded.
    Unparseable(QuotaParseError),
    /// Decoded, but no reset time present.
    NoResetTime,
    /// Request carried no client identity.
    NoIdentity,
    /// Identity did not resolve to an email.
    UnknownIdentity,
    /// Store lookup or write failed.
    StorageFailed(StorageError),
}

impl QuotaOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, Self::Recorded(_))
    }

    /// Stable label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Recorded(_) => "recorded",
            Self::Unparseable(_) => "unparseable",
            Self::NoResetTime => "no_reset_time",
            Self::NoIdentity => "no_identity",
            Self::UnknownIdentity => "unknown_identity",
            Self::StorageFailed(_) => "storage_failed",
        }
    }
}

/// Writes quota records for rate-limited accounts.
#[derive(Clone)]
pub struct QuotaBookkeeper {
    store: Arc<dyn SessionStore>,
}

impl QuotaBookkeeper {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Inspect a 429 body and record quota state for the caller's account.
    ///
    /// Lookup and write are attempted once each. The returned outcome is for
    /// logging and metrics only.
    pub async fn observe(&self, identity: Option<&ClientIdentity>, body: &[u8]) -> QuotaOutcome {
        let details = match parse_rate_limit_body(body) {
            Ok(details) => details,
            Err(e) => {
                debug!(error = %e, "Rate-limit body not parseable, skipping quota update");
                return QuotaOutcome::Unparseable(e);
            }
        };

        let Some(resets_at) = details.reset_time() else {
            debug!(
                resets_at = ?details.resets_at,
                "Rate-limit body has no usable resetsAt, skipping quota update"
            );
            return QuotaOutcome::NoResetTime;
        };

        let Some(identity) = identity else {
            debug!("No client identity on rate-limited request, skipping quota update");
            return QuotaOutcome::NoIdentity;
        };

        let email = match self.store.lookup_email_by_identity(identity).await {
            Ok(Some(email)) => email,
            Ok(None) => {
                debug!(identity = %identity, "Client identity has no bound email");
                return QuotaOutcome::UnknownIdentity;
            }
            Err(e) => {
                warn!(error = %e, "Email lookup failed during quota bookkeeping");
                return QuotaOutcome::StorageFailed(e);
            }
        };

        let record = QuotaRecord {
            email,
            resets_at,
            remaining: details.remaining,
        };

        if let Err(e) = self.store.write_quota(&record).await {
            warn!(error = %e, "Quota write failed");
            return QuotaOutcome::StorageFailed(e);
        }

        info!(
            resets_at = %record
                .resets_at_utc()
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| record.resets_at.to_string()),
            remaining = ?record.remaining,
            "Quota state recorded"
        );
        QuotaOutcome::Recorded(record)
    }
}
