//! Redis-backed session store.
//!
//! Lets several proxy instances share identity bindings and quota records.
//!
//! ## Key layout
//!
//! - `<prefix>identity:<client identity>` → email (plain string)
//! - `<prefix>quota:<email>` → [`QuotaRecord`] as JSON
//!
//! Quota records expire after [`RedisStoreConfig::quota_ttl`] when set;
//! identity bindings never expire.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use std::fmt;
use std::time::Duration;

use super::{SessionStore, StorageResult};
use crate::identity::ClientIdentity;
use crate::quota::QuotaRecord;

#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix for every key (default: "sessiongate:")
    pub key_prefix: String,
    /// Expiry for quota records. `None` keeps them until overwritten.
    pub quota_ttl: Option<Duration>,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "sessiongate:".to_string(),
            quota_ttl: None,
        }
    }
}

/// Session store shared through Redis.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect with default configuration.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection, config })
    }

    fn identity_key(&self, identity: &ClientIdentity) -> String {
        format!("{}identity:{}", self.config.key_prefix, identity)
    }

    fn quota_key(&self, email: &str) -> String {
        format!("{}quota:{}", self.config.key_prefix, email)
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn lookup_email_by_identity(
        &self,
        identity: &ClientIdentity,
    ) -> StorageResult<Option<String>> {
        let mut conn = self.connection.clone();
        let email: Option<String> = conn.get(self.identity_key(identity)).await?;
        Ok(email.filter(|e| !e.is_empty()))
    }

    async fn bind_identity(&self, identity: &ClientIdentity, email: &str) -> StorageResult<()> {
        let mut conn = self.connection.clone();
        conn.set::<_, _, ()>(self.identity_key(identity), email)
            .await?;
        Ok(())
    }

    async fn write_quota(&self, record: &QuotaRecord) -> StorageResult<()> {
        let key = self.quota_key(&record.email);
        let value = serde_json::to_string(record)?;
        let mut conn = self.connection.clone();
        match self.config.quota_ttl {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn read_quota(&self, email: &str) -> StorageResult<Option<QuotaRecord>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(self.quota_key(email)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
