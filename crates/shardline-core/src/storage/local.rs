//! Local filesystem object store
//!
//! A directory stands in for a bucket: object keys are relative paths under
//! it. Used for single-host deployments and for tests.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::{ObjectMetadata, ObjectStore};
use crate::{Error, Result};

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if root.as_os_str().is_empty() {
            return Err(Error::config("local object store needs a bucket directory"));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a key below the root; keys that climb out are rejected
    fn resolve_path(&self, remote_key: &str) -> Result<PathBuf> {
        let key = Path::new(remote_key.trim_start_matches('/'));
        if key
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::invalid_input(format!(
                "object key '{}' escapes the bucket",
                remote_key
            )));
        }
        Ok(self.root.join(key))
    }
}

fn map_io(remote_key: &str, path: &Path, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(format!("object not found: {}", remote_key))
    } else {
        Error::io(path, e)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn provider(&self) -> &str {
        "local"
    }

    async fn download(&self, remote_key: &str, local_path: &Path) -> Result<u64> {
        let remote_path = self.resolve_path(remote_key)?;

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }

        fs::copy(&remote_path, local_path)
            .await
            .map_err(|e| map_io(remote_key, &remote_path, e))
    }

    async fn metadata(&self, remote_key: &str) -> Result<ObjectMetadata> {
        let remote_path = self.resolve_path(remote_key)?;
        let metadata = fs::metadata(&remote_path)
            .await
            .map_err(|e| map_io(remote_key, &remote_path, e))?;

        if !metadata.is_file() {
            return Err(Error::NotFound(format!("not an object: {}", remote_key)));
        }

        let modified = metadata.modified().map_err(|e| Error::io(&remote_path, e))?;
        let last_modified: chrono::DateTime<chrono::Utc> = modified.into();

        // Size plus mtime changes whenever the file is rewritten
        let etag = format!(
            "{:x}-{:x}",
            metadata.len(),
            last_modified.timestamp_nanos_opt().unwrap_or_default()
        );

        Ok(ObjectMetadata {
            size_bytes: metadata.len(),
            last_modified,
            etag: Some(etag),
        })
    }
}
