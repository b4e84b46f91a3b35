//! Session storage: identity-to-email bindings and per-account quota records.
//!
//! The proxy reads one thing (which account email a client identity belongs
//! to) and writes two (quota records after a 429, identity bindings after a
//! login that carried an email). Backends implement [`SessionStore`]:
//!
//! - [`MemoryStore`]: process-local, `DashMap` backed. Default.
//! - `RedisStore`: shared across instances. Requires the `redis-storage`
//!   feature.
//!
//! Store errors never reach the client. Callers log them and carry on.

use async_trait::async_trait;
use thiserror::Error;

use crate::identity::ClientIdentity;
use crate::quota::QuotaRecord;

pub mod memory;
#[cfg(feature = "redis-storage")]
pub mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis-storage")]
pub use redis::{RedisStore, RedisStoreConfig};

/// Storage backend failure.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend refused or failed the operation.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Stored value could not be encoded or decoded.
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "redis-storage")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Key-value session storage used for quota bookkeeping and identity binding.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Email bound to a client identity, if any.
    async fn lookup_email_by_identity(
        &self,
        identity: &ClientIdentity,
    ) -> StorageResult<Option<String>>;

    /// Bind a client identity to an account email, replacing any previous binding.
    async fn bind_identity(&self, identity: &ClientIdentity, email: &str) -> StorageResult<()>;

    /// Write a quota record keyed by its email, replacing any previous one.
    async fn write_quota(&self, record: &QuotaRecord) -> StorageResult<()>;

    /// Latest quota record for an email.
    async fn read_quota(&self, email: &str) -> StorageResult<Option<QuotaRecord>>;

    /// Backend name for logs and readiness output.
    fn backend(&self) -> &'static str;
}
