//! Downloads table versions into the working directory
//!
//! ```text
//! {work_dir}/{table}/{version}/
//!   ├─ 0.db, 1.db, ...   shard files
//!   ├─ manifest.json     manifest with local shard paths
//!   └─ _SUCCESS          empty marker, written and fsynced last
//! ```
//!
//! The marker is the only local validity gate. A directory without it is
//! never opened, and a failed load removes what it wrote.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::fs;
use tracing::{debug, info, warn};

use shardline_core::retry::{retry_async, RetryPolicy};
use shardline_core::storage::ObjectStore;
use shardline_core::model::is_path_segment;
use shardline_core::{Error, Manifest, Result, TableDescriptor};

pub const MARKER_FILE: &str = "_SUCCESS";
pub const MANIFEST_FILE: &str = "manifest.json";
const REMOTE_MANIFEST_FILE: &str = "manifest.remote.json";
const DEFAULT_TRANSFERS: usize = 4;

pub struct ShardLoader {
    work_dir: PathBuf,
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    max_transfers: usize,
}

impl ShardLoader {
    pub fn new(work_dir: impl Into<PathBuf>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            work_dir: work_dir.into(),
            store,
            retry: RetryPolicy::default(),
            max_transfers: DEFAULT_TRANSFERS,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Concurrent shard transfers within one table load
    pub fn with_max_transfers(mut self, max_transfers: usize) -> Self {
        self.max_transfers = max_transfers.max(1);
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn version_dir(&self, table: &str, version: &str) -> PathBuf {
        version_dir(&self.work_dir, table, version)
    }

    pub fn manifest_path(&self, table: &str, version: &str) -> PathBuf {
        self.version_dir(table, version).join(MANIFEST_FILE)
    }

    /// Manifest path of a complete local copy of `table` at `version`
    pub fn local_manifest(&self, table: &str, version: &str) -> Option<PathBuf> {
        local_manifest(&self.work_dir, table, version)
    }

    /// Fetches the descriptor's current version and returns its manifest path
    pub async fn load(&self, desc: &TableDescriptor) -> Result<PathBuf> {
        let version = desc.current_version.as_str();
        if version.is_empty() {
            return Err(Error::invalid_input(format!(
                "table '{}' has no current version",
                desc.name
            )));
        }
        desc.check_local_names()?;

        let dir = self.version_dir(&desc.name, version);
        if fs::metadata(&dir).await.is_ok() {
            // leftover from an interrupted load
            fs::remove_dir_all(&dir)
                .await
                .map_err(|e| Error::io(&dir, e))?;
        }
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io(&dir, e))?;

        match self.fetch_into(desc, &dir).await {
            Ok(path) => Ok(path),
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&dir).await {
                    warn!(dir = %dir.display(), error = %cleanup, "Failed to clean up after failed load");
                }
                Err(e)
            }
        }
    }

    async fn fetch_into(&self, desc: &TableDescriptor, dir: &Path) -> Result<PathBuf> {
        let version = desc.current_version.as_str();
        let remote_manifest = dir.join(REMOTE_MANIFEST_FILE);
        let manifest_key = desc.manifest_key(version);
        retry_async(&self.retry, || self.store.download(&manifest_key, &remote_manifest)).await?;

        let bytes = fs::read(&remote_manifest)
            .await
            .map_err(|e| Error::io(&remote_manifest, e))?;
        let mut manifest = Manifest::from_slice(&bytes)?;
        check_manifest(desc, &manifest)?;

        let transfers = plan_transfers(desc, &manifest, dir)?;
        let total = transfers.len();
        let started = std::time::Instant::now();

        let results: Vec<Result<u64>> = stream::iter(transfers.clone())
            .map(|(remote, local)| async move {
                let bytes =
                    retry_async(&self.retry, || self.store.download(&remote, &local)).await?;
                debug!(remote = %remote, bytes, "Shard downloaded");
                Ok(bytes)
            })
            .buffer_unordered(self.max_transfers)
            .collect()
            .await;

        let mut bytes = 0u64;
        for result in results {
            bytes += result?;
        }

        manifest.partitions = transfers
            .iter()
            .map(|(_, local)| local.display().to_string())
            .collect();
        let manifest_path = dir.join(MANIFEST_FILE);
        manifest.write_to(&manifest_path)?;
        if let Err(e) = fs::remove_file(&remote_manifest).await {
            warn!(path = %remote_manifest.display(), error = %e, "Failed to remove remote manifest copy");
        }

        write_marker(dir).await?;

        info!(
            table = %desc.name,
            version,
            shards = total,
            bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Table version downloaded"
        );
        Ok(manifest_path)
    }
}

pub fn version_dir(work_dir: &Path, table: &str, version: &str) -> PathBuf {
    work_dir.join(table).join(version)
}

/// Manifest path of a complete local copy of `table` at `version`
///
/// Requires the marker and a manifest that parses and names the same table
/// and version. Anything else means the version must be fetched.
pub fn local_manifest(work_dir: &Path, table: &str, version: &str) -> Option<PathBuf> {
    if !is_path_segment(table) || !is_path_segment(version) {
        return None;
    }
    let dir = version_dir(work_dir, table, version);
    if !dir.join(MARKER_FILE).is_file() {
        return None;
    }
    let path = dir.join(MANIFEST_FILE);
    match Manifest::from_file(&path) {
        Ok(m) if m.name == table && m.version == version => Some(path),
        Ok(m) => {
            warn!(
                table,
                version,
                found_table = %m.name,
                found_version = %m.version,
                "Local manifest does not match its directory"
            );
            None
        }
        Err(e) => {
            warn!(table, version, error = %e, "Ignoring unusable local version");
            None
        }
    }
}

fn check_manifest(desc: &TableDescriptor, manifest: &Manifest) -> Result<()> {
    if manifest.name != desc.name || manifest.version != desc.current_version {
        return Err(Error::manifest(format!(
            "expected {}@{}, manifest describes {}@{}",
            desc.name, desc.current_version, manifest.name, manifest.version
        )));
    }
    if desc.partitions > 0 && desc.partitions != manifest.partitions.len() {
        return Err(Error::manifest(format!(
            "table '{}' declares {} partitions, manifest lists {}",
            desc.name,
            desc.partitions,
            manifest.partitions.len()
        )));
    }
    Ok(())
}

/// Pairs each partition's object key with its local destination
///
/// Bare file names are looked up under the descriptor's data directory.
fn plan_transfers(
    desc: &TableDescriptor,
    manifest: &Manifest,
    dir: &Path,
) -> Result<Vec<(String, PathBuf)>> {
    let mut seen = HashSet::new();
    manifest
        .partitions
        .iter()
        .map(|partition| {
            let remote = if partition.contains('/') {
                partition.clone()
            } else {
                format!("{}/{}", desc.data_dir.trim_end_matches('/'), partition)
            };
            let file_name = Path::new(partition)
                .file_name()
                .and_then(|n| n.to_str())
                .filter(|n| *n != MARKER_FILE && *n != MANIFEST_FILE && *n != REMOTE_MANIFEST_FILE)
                .ok_or_else(|| Error::manifest(format!("bad partition path '{}'", partition)))?;
            if !seen.insert(file_name.to_string()) {
                return Err(Error::manifest(format!(
                    "duplicate partition file name '{}'",
                    file_name
                )));
            }
            Ok((remote, dir.join(file_name)))
        })
        .collect()
}

async fn write_marker(dir: &Path) -> Result<()> {
    let marker = dir.join(MARKER_FILE);
    let file = fs::File::create(&marker)
        .await
        .map_err(|e| Error::io(&marker, e))?;
    file.sync_all().await.map_err(|e| Error::io(&marker, e))
}
