//! Coordination store backed by a catalog file
//!
//! Every read first re-reads the file. When its bytes differ from the last
//! applied copy, the catalog is synced into the in-process store, which
//! bumps the store revision, and the refresh cycle sees the new descriptors.
//! Leases and the fleet lock stay in-process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use shardline_core::coordination::{
    CoordinationStore, KeyValue, LeaseId, MemoryCoordinationStore, PrefixRead,
};
use shardline_core::{Error, Result};

use crate::config::Catalog;

pub struct CatalogFileStore {
    path: PathBuf,
    machine_id: String,
    store: Arc<MemoryCoordinationStore>,
    applied: Mutex<Option<Vec<u8>>>,
}

impl CatalogFileStore {
    pub fn new(
        path: impl Into<PathBuf>,
        machine_id: impl Into<String>,
        store: Arc<MemoryCoordinationStore>,
    ) -> Self {
        Self {
            path: path.into(),
            machine_id: machine_id.into(),
            store,
            applied: Mutex::new(None),
        }
    }

    /// Applies the file if it changed since the last call
    ///
    /// Returns whether anything was written. An unreadable file is reported
    /// as an unavailable store; an invalid one as a config error. Neither
    /// touches the store.
    pub async fn sync(&self) -> Result<bool> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            Error::remote(format!("reading catalog '{}': {}", self.path.display(), e))
        })?;

        let mut applied = self.applied.lock().await;
        if applied.as_deref() == Some(bytes.as_slice()) {
            return Ok(false);
        }

        let catalog: Catalog = serde_yaml::from_slice(&bytes).map_err(|e| {
            Error::config(format!("parsing catalog '{}': {}", self.path.display(), e))
        })?;
        catalog.sync(&self.store, &self.machine_id)?;
        *applied = Some(bytes);

        info!(
            path = %self.path.display(),
            revision = self.store.revision(),
            "Catalog file applied"
        );
        Ok(true)
    }
}

#[async_trait]
impl CoordinationStore for CatalogFileStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.sync().await?;
        self.store.get(key).await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<PrefixRead> {
        self.sync().await?;
        self.store.get_prefix(prefix).await
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        self.store.grant_lease(ttl).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        self.store.keep_alive(lease).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.store.revoke_lease(lease).await
    }

    async fn create_if_absent(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<bool> {
        self.store.create_if_absent(key, value, lease).await
    }
}
