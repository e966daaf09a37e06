//! Published views and the read path
//!
//! A [`View`] is an immutable table-name → table map. The [`Engine`] keeps
//! the current one in an atomically swappable slot:
//!
//! ```text
//! readers:  load_full() ──► Arc<View> ──► Arc<Table> clones ──► lookups
//! refresh:  clone map ──► apply changes ──► swap() ──► lazy_free displaced
//! ```
//!
//! Readers never take a lock shared with the refresh path. A reader holding
//! an old view keeps working against the old tables until it is done.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use shardline_core::{FeatureValue, MergeOperator, Result, StatusTracker};

use crate::observability;
use crate::table::{miss_on_error, Table};

/// Immutable snapshot of the live tables
#[derive(Debug, Default, Clone)]
pub struct View {
    tables: BTreeMap<String, Arc<Table>>,
}

impl View {
    pub fn get(&self, name: &str) -> Option<&Arc<Table>> {
        self.tables.get(name)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Table names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<Table>> {
        self.tables.values()
    }
}

/// One table's answer for a key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fragment {
    pub table: String,
    pub version: String,
    pub values: BTreeMap<String, FeatureValue>,
}

/// Changes to apply on top of the current view
#[derive(Debug, Default)]
pub struct ViewUpdate {
    /// New or replacement tables, keyed by their own name
    pub upserts: Vec<Arc<Table>>,
    pub removals: Vec<String>,
}

impl ViewUpdate {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

/// The serving engine: one view slot plus refresh bookkeeping
pub struct Engine {
    view: ArcSwap<View>,
    revision: AtomicI64,
    status: Arc<StatusTracker>,
    query_timeout: Option<Duration>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("tables", &self.view.load().len())
            .field("revision", &self.revision())
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Engine {
    /// Creates an engine with an empty view
    ///
    /// `query_timeout` bounds each table lookup; a table that does not
    /// answer in time is skipped like a miss.
    pub fn new(query_timeout: Option<Duration>) -> Self {
        Self {
            view: ArcSwap::from_pointee(View::default()),
            revision: AtomicI64::new(0),
            status: Arc::new(StatusTracker::new()),
            query_timeout: query_timeout.filter(|t| !t.is_zero()),
        }
    }

    /// The currently published view
    pub fn view(&self) -> Arc<View> {
        self.view.load_full()
    }

    pub fn status(&self) -> &Arc<StatusTracker> {
        &self.status
    }

    /// Last coordination-store revision a refresh adopted
    pub fn revision(&self) -> i64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Moves the revision cursor forward
    ///
    /// Returns `false` and leaves the cursor alone for an older revision.
    pub fn adopt_revision(&self, revision: i64) -> bool {
        self.revision
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (revision >= current).then_some(revision)
            })
            .is_ok()
    }

    /// Fragments for `key` from the requested tables, or from all tables
    ///
    /// Unknown table names, misses, failed and timed-out lookups are
    /// skipped. Fragments come back in table-name order.
    pub async fn get(&self, key: &str, tables: &[String]) -> Vec<Fragment> {
        let _timer = observability::time_lookup();
        let view = self.view();

        let selected: Vec<Arc<Table>> = if tables.is_empty() {
            view.tables().cloned().collect()
        } else {
            let wanted: HashSet<&str> = tables.iter().map(String::as_str).collect();
            view.tables()
                .filter(|t| wanted.contains(t.name()))
                .cloned()
                .collect()
        };
        drop(view);

        let lookups = selected.into_iter().map(|table| self.lookup(table, key));
        let fragments: Vec<Fragment> = join_all(lookups).await.into_iter().flatten().collect();

        if fragments.is_empty() {
            observability::record_lookup_miss();
        }
        fragments
    }

    async fn lookup(&self, table: Arc<Table>, key: &str) -> Option<Fragment> {
        let name = table.name().to_string();
        let version = table.version().to_string();
        let key = key.to_string();

        let task = tokio::task::spawn_blocking(move || table.get_values(&key));
        let joined = match self.query_timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(table = %name, timeout_ms = limit.as_millis() as u64, "Lookup timed out");
                    return None;
                }
            },
            None => task.await,
        };

        let result = match joined {
            Ok(result) => result,
            Err(e) => {
                warn!(table = %name, error = %e, "Lookup task failed");
                return None;
            }
        };

        miss_on_error(&name, result).map(|values| Fragment {
            table: name,
            version,
            values,
        })
    }

    /// Looks up `key` and folds the fragments with `op`
    ///
    /// `Ok(None)` means no table had the key.
    pub async fn get_merged<M: MergeOperator>(
        &self,
        key: &str,
        tables: &[String],
        op: &M,
    ) -> Result<Option<M::Output>> {
        let fragments = self.get(key, tables).await;
        let outputs = fragments
            .iter()
            .map(|f| op.fragment(&f.table, &f.values))
            .collect::<Result<Vec<_>>>()?;
        Ok(op.merge_all(outputs))
    }

    /// Publishes the current view with `update` applied
    ///
    /// Displaced tables are retired after the new view is visible. An empty
    /// update publishes nothing and keeps the view identity unchanged.
    /// Returns the retired tables' `(name, version)` pairs.
    pub fn apply(&self, update: ViewUpdate) -> Vec<(String, String)> {
        if update.is_empty() {
            return Vec::new();
        }

        let current = self.view();
        let mut tables = current.tables.clone();
        drop(current);

        let mut displaced = Vec::new();
        for name in &update.removals {
            if let Some(old) = tables.remove(name) {
                displaced.push(old);
            }
        }
        for table in update.upserts {
            if let Some(old) = tables.insert(table.name().to_string(), table) {
                displaced.push(old);
            }
        }

        let count = tables.len();
        self.view.store(Arc::new(View { tables }));
        debug!(tables = count, "Published view");

        retire(displaced)
    }

    /// Publishes an empty view and retires every table
    pub fn clear(&self) -> Vec<(String, String)> {
        let old = self.view.swap(Arc::new(View::default()));
        self.status.clear();
        let displaced: Vec<Arc<Table>> = old.tables.values().cloned().collect();
        drop(old);
        if !displaced.is_empty() {
            info!(tables = displaced.len(), "Cleared view");
        }
        retire(displaced)
    }
}

fn retire(tables: Vec<Arc<Table>>) -> Vec<(String, String)> {
    tables
        .into_iter()
        .map(|table| {
            let id = (table.name().to_string(), table.version().to_string());
            table.lazy_free();
            id
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use shardline_core::codec::RowEncoder;
    use shardline_core::{
        DataType, FeatureSpec, JsonMergeOperator, Manifest, MapMergeOperator, StoreType,
    };

    use crate::table::{RowSource, TableOptions};

    /// Answers every key listed with a single int64 column
    struct StaticSource(BTreeMap<String, i64>);

    impl RowSource for StaticSource {
        fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
            let Some(v) = self.0.get(key) else {
                return Ok(None);
            };
            let mut enc = RowEncoder::new(1)?;
            enc.push_int64(*v)?;
            enc.finish().map(Some)
        }

        fn shard_count(&self) -> usize {
            1
        }
    }

    fn table(name: &str, version: &str, rows: &[(&str, i64)]) -> Arc<Table> {
        let mut features = BTreeMap::new();
        features.insert(
            format!("{}_n", name),
            FeatureSpec {
                data_type: DataType::Int64,
                store_type: StoreType::Integer,
                separator: None,
            },
        );
        let manifest = Manifest {
            name: name.to_string(),
            partitions: vec!["0.db".into()],
            version: version.to_string(),
            key_column: "k".to_string(),
            features,
        };
        let source = StaticSource(rows.iter().map(|(k, v)| (k.to_string(), *v)).collect());
        Arc::new(Table::with_source(
            &manifest,
            PathBuf::from(format!("/work/{}/{}", name, version)),
            Box::new(source),
            &TableOptions::default(),
        ))
    }

    fn engine_with(tables: Vec<Arc<Table>>) -> Engine {
        let engine = Engine::default();
        engine.apply(ViewUpdate {
            upserts: tables,
            removals: vec![],
        });
        engine
    }

    #[tokio::test]
    async fn test_get_all_and_filtered() {
        let engine = engine_with(vec![
            table("profile", "v1", &[("u1", 1), ("u2", 2)]),
            table("behavior", "v1", &[("u2", 20)]),
        ]);

        let all = engine.get("u2", &[]).await;
        let names: Vec<_> = all.iter().map(|f| f.table.as_str()).collect();
        assert_eq!(names, vec!["behavior", "profile"]);

        let only = engine.get("u1", &["behavior".to_string()]).await;
        assert!(only.is_empty());

        let unknown = engine.get("u1", &["nope".to_string(), "profile".to_string()]).await;
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].values["profile_n"], FeatureValue::Int(1));
    }

    #[tokio::test]
    async fn test_get_merged_json() {
        let engine = engine_with(vec![
            table("a", "v1", &[("k", 1)]),
            table("b", "v1", &[("k", 2)]),
        ]);
        let merged = engine
            .get_merged("k", &[], &JsonMergeOperator)
            .await
            .unwrap()
            .unwrap();
        let body = JsonMergeOperator::wrap(&merged);
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["a_n"], 1);
        assert_eq!(parsed["b_n"], 2);

        assert!(engine
            .get_merged("missing", &[], &JsonMergeOperator)
            .await
            .unwrap()
            .is_none());
    }

    /// Has rows for the listed keys but no feature columns
    struct KeyOnlySource(Vec<String>);

    impl RowSource for KeyOnlySource {
        fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
            if !self.0.iter().any(|k| k == key) {
                return Ok(None);
            }
            RowEncoder::new(0)?.finish().map(Some)
        }

        fn shard_count(&self) -> usize {
            1
        }
    }

    #[tokio::test]
    async fn test_key_only_row_is_a_hit_for_every_format() {
        let mut features = BTreeMap::new();
        features.insert(
            "k".to_string(),
            FeatureSpec {
                data_type: DataType::String,
                store_type: StoreType::Text,
                separator: None,
            },
        );
        let manifest = Manifest {
            name: "members".to_string(),
            partitions: vec!["0.db".into()],
            version: "v1".to_string(),
            key_column: "k".to_string(),
            features,
        };
        let members = Arc::new(Table::with_source(
            &manifest,
            PathBuf::from("/work/members/v1"),
            Box::new(KeyOnlySource(vec!["k".to_string()])),
            &TableOptions::default(),
        ));
        let engine = engine_with(vec![members]);

        let fragments = engine.get("k", &[]).await;
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].values.is_empty());

        let merged = engine.get_merged("k", &[], &JsonMergeOperator).await.unwrap();
        assert_eq!(merged, Some(Vec::new()));
        let qualified = engine.get_merged("k", &[], &MapMergeOperator).await.unwrap();
        assert_eq!(qualified, Some(BTreeMap::new()));

        assert!(engine
            .get_merged("other", &[], &JsonMergeOperator)
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_empty_update_keeps_view_identity() {
        let engine = engine_with(vec![table("a", "v1", &[])]);
        let before = engine.view();
        assert!(engine.apply(ViewUpdate::default()).is_empty());
        assert!(Arc::ptr_eq(&before, &engine.view()));
    }

    #[test]
    fn test_apply_replaces_and_retires() {
        let engine = engine_with(vec![table("a", "v1", &[]), table("b", "v1", &[])]);
        let old_view = engine.view();

        let retired = engine.apply(ViewUpdate {
            upserts: vec![table("a", "v2", &[])],
            removals: vec!["b".to_string()],
        });
        assert_eq!(
            retired,
            vec![
                ("b".to_string(), "v1".to_string()),
                ("a".to_string(), "v1".to_string())
            ]
        );

        let view = engine.view();
        assert_eq!(view.names().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(view.get("a").unwrap().version(), "v2");

        // the old snapshot is untouched and still usable
        assert_eq!(old_view.len(), 2);
        assert_eq!(old_view.get("a").unwrap().version(), "v1");
    }

    #[test]
    fn test_clear_empties_view() {
        let engine = engine_with(vec![table("a", "v1", &[])]);
        engine.status().set("a", shardline_core::TableStatus::Serving);
        assert_eq!(engine.clear().len(), 1);
        assert!(engine.view().is_empty());
        assert!(engine.status().snapshot().is_empty());
    }

    #[test]
    fn test_revision_cursor_is_monotonic() {
        let engine = Engine::default();
        assert!(engine.adopt_revision(5));
        assert!(engine.adopt_revision(5));
        assert!(!engine.adopt_revision(4));
        assert_eq!(engine.revision(), 5);
        assert!(engine.adopt_revision(9));
        assert_eq!(engine.revision(), 9);
    }
}
