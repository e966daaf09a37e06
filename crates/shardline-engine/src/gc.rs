//! Garbage collection of superseded local versions
//!
//! Runs at the end of a refresh cycle, after displaced tables were retired.
//! Any version directory (one holding a marker or manifest) that the live
//! view does not reference is removed. Readers that still hold a retired
//! table keep their open file handles.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use shardline_core::{Error, Result};

use crate::loader::{MANIFEST_FILE, MARKER_FILE};
use crate::view::View;

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Version directories referenced by `view`
pub fn hold_set(view: &View) -> HashSet<PathBuf> {
    view.tables().map(|t| normalize(t.dir())).collect()
}

/// Removes unreferenced version directories under `work_dir`
///
/// Returns the removed directories. Failing to remove one directory is
/// logged and does not stop the sweep.
pub fn collect_garbage(work_dir: &Path, hold: &HashSet<PathBuf>) -> Result<Vec<PathBuf>> {
    if !work_dir.exists() {
        return Ok(Vec::new());
    }

    let mut stale: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(work_dir).min_depth(1) {
        let entry = entry.map_err(|e| Error::StorageError(anyhow::anyhow!("walking work dir: {}", e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name();
        if name != MARKER_FILE && name != MANIFEST_FILE {
            continue;
        }
        let Some(dir) = entry.path().parent() else {
            continue;
        };
        if !hold.contains(&normalize(dir)) && !stale.iter().any(|s| s == dir) {
            stale.push(dir.to_path_buf());
        }
    }

    let mut removed = Vec::with_capacity(stale.len());
    for dir in stale {
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(dir = %dir.display(), "Removed stale version");
                remove_if_empty(dir.parent(), work_dir);
                removed.push(dir);
            }
            Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove stale version"),
        }
    }

    if !removed.is_empty() {
        info!(removed = removed.len(), "Garbage-collected stale versions");
    }
    Ok(removed)
}

/// Drops a table directory once its last version is gone
fn remove_if_empty(dir: Option<&Path>, work_dir: &Path) {
    let Some(dir) = dir else { return };
    if dir == work_dir {
        return;
    }
    let empty = std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if empty {
        if let Err(e) = std::fs::remove_dir(dir) {
            warn!(dir = %dir.display(), error = %e, "Failed to remove empty table directory");
        }
    }
}
