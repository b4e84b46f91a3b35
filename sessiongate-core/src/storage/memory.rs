//! In-process session store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{SessionStore, StorageError, StorageResult};
use crate::identity::ClientIdentity;
use crate::quota::QuotaRecord;

/// `DashMap`-backed store. State lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    bindings: DashMap<String, String>,
    quotas: DashMap<String, QuotaRecord>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an identity binding synchronously.
    pub fn insert_binding(&self, identity: &ClientIdentity, email: impl Into<String>) {
        self.bindings
            .insert(identity.as_str().to_string(), email.into());
    }

    /// Current quota record for `email`, if any.
    pub fn quota_for(&self, email: &str) -> Option<QuotaRecord> {
        self.quotas.get(email).map(|r| r.value().clone())
    }

    pub fn quota_count(&self) -> usize {
        self.quotas.len()
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Make every subsequent write fail with [`StorageError::Backend`].
    ///
    /// Used to exercise degraded paths without a real backend outage.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StorageError::Backend("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn lookup_email_by_identity(
        &self,
        identity: &ClientIdentity,
    ) -> StorageResult<Option<String>> {
        Ok(self
            .bindings
            .get(identity.as_str())
            .map(|e| e.value().clone()))
    }

    async fn bind_identity(&self, identity: &ClientIdentity, email: &str) -> StorageResult<()> {
        self.check_writable()?;
        self.insert_binding(identity, email);
        Ok(())
    }

    async fn write_quota(&self, record: &QuotaRecord) -> StorageResult<()> {
        self.check_writable()?;
        self.quotas.insert(record.email.clone(), record.clone());
        Ok(())
    }

    async fn read_quota(&self, email: &str) -> StorageResult<Option<QuotaRecord>> {
        Ok(self.quota_for(email))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
