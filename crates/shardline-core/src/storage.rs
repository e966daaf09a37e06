//! Object storage abstraction
//!
//! Table artifacts (manifests and shard files) are published to a bucket by
//! the offline pipeline. The engine only ever reads them: it downloads
//! objects into its working directory and occasionally asks for freshness
//! metadata.
//!
//! A database descriptor names its storage by provider tag. An
//! [`ObjectStoreFactory`] turns that tag into an [`ObjectStore`]. The
//! in-tree factory knows `local`; deployments inject their own factory for
//! cloud providers.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::StorageLocation;
use crate::{Error, Result};

/// Object metadata returned by storage backends
#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
    pub etag: Option<String>,
}

/// Read-only access to one bucket
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Provider tag this store serves, e.g. `local`
    fn provider(&self) -> &str;

    /// Downloads `remote_key` to `local_path`, returning the byte count
    ///
    /// # Errors
    /// `Error::NotFound` if the object does not exist.
    async fn download(&self, remote_key: &str, local_path: &Path) -> Result<u64>;

    /// # Errors
    /// `Error::NotFound` if the object does not exist.
    async fn metadata(&self, remote_key: &str) -> Result<ObjectMetadata>;

    async fn etag(&self, remote_key: &str) -> Result<Option<String>> {
        Ok(self.metadata(remote_key).await?.etag)
    }

    async fn last_modified(&self, remote_key: &str) -> Result<DateTime<Utc>> {
        Ok(self.metadata(remote_key).await?.last_modified)
    }
}

/// Builds object stores from descriptor storage locations
pub trait ObjectStoreFactory: Send + Sync {
    fn create(&self, location: &StorageLocation) -> Result<Arc<dyn ObjectStore>>;
}

/// Factory for the providers that ship in-tree
///
/// `local` maps the bucket to a directory. When `endpoint` is set, the
/// bucket is resolved relative to it.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultObjectStoreFactory;

impl ObjectStoreFactory for DefaultObjectStoreFactory {
    fn create(&self, location: &StorageLocation) -> Result<Arc<dyn ObjectStore>> {
        match location.provider.as_str() {
            "local" => {
                let root = match &location.endpoint {
                    Some(endpoint) => Path::new(endpoint).join(&location.bucket),
                    None => Path::new(&location.bucket).to_path_buf(),
                };
                Ok(Arc::new(local::LocalObjectStore::new(root)?))
            }
            other => Err(Error::config(format!(
                "unsupported storage provider '{}' (bucket '{}')",
                other, location.bucket
            ))),
        }
    }
}

pub mod local;
