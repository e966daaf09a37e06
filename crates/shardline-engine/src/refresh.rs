//! Periodic reconciliation of local state against the coordination store
//!
//! One cycle:
//!
//! 1. Read this machine's database binding. No binding means stop serving:
//!    the view is cleared (local data stays on disk).
//! 2. Read the database descriptor and all table descriptors in one prefix
//!    read, at one store revision. Older revisions than the last adopted
//!    one are ignored.
//! 3. Diff each table's `current_version` against the live view and the
//!    working directory. Tables not live at their current version become
//!    jobs: reopen when a complete local copy exists, download otherwise.
//! 4. Without jobs, only removed tables are retired.
//! 5. With jobs, take the fleet lock, run jobs with bounded concurrency,
//!    publish one new view, release the lock.
//! 6. Garbage-collect version directories the new view does not use.
//!
//! A failing table is skipped for the cycle; its previous version keeps
//! serving. A failing cycle leaves the view untouched and the driver keeps
//! ticking.

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

use shardline_core::coordination::CoordinationStore;
use shardline_core::lock::FleetLock;
use shardline_core::model::keys;
use shardline_core::retry::RetryPolicy;
use shardline_core::storage::{ObjectStore, ObjectStoreFactory};
use shardline_core::{
    DatabaseDescriptor, Error, MachineBinding, Result, TableDescriptor, TableStatus,
};

use crate::gc;
use crate::loader::{local_manifest, ShardLoader};
use crate::observability;
use crate::table::{Table, TableOptions};
use crate::view::{Engine, ViewUpdate};

/// Engine and refresh settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identity used for the machine binding and as lock holder
    pub machine_id: String,
    pub work_dir: PathBuf,
    /// Total cached rows, split evenly across tables each cycle
    pub cache_capacity: usize,
    pub cache_ttl: Option<Duration>,
    pub interval: Duration,
    pub lock_timeout: Duration,
    pub lock_ttl: Duration,
    /// Tables loaded at the same time
    pub max_concurrent_loads: usize,
    /// Read connections per shard
    pub pool_size: u32,
    pub retry: RetryPolicy,
    /// Bound on each table lookup; `None` waits indefinitely
    pub query_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            machine_id: "localhost".to_string(),
            work_dir: PathBuf::from("./shardline-data"),
            cache_capacity: 0,
            cache_ttl: None,
            interval: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(10),
            lock_ttl: Duration::from_secs(15),
            max_concurrent_loads: 4,
            pool_size: 4,
            retry: RetryPolicy::default(),
            query_timeout: Some(Duration::from_millis(500)),
        }
    }
}

impl EngineConfig {
    /// An empty engine configured for these settings
    pub fn build_engine(&self) -> Engine {
        Engine::new(self.query_timeout)
    }
}

/// Hook around disruptive reloads, e.g. a service registry
///
/// Runs under the fleet lock. Failures are logged and do not stop the reload.
#[async_trait]
pub trait ServiceRegistrar: Send + Sync {
    async fn deregister(&self, database: &str) -> Result<()>;
    async fn register(&self, database: &str) -> Result<()>;
}

/// What a cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing changed; the view was not republished
    Unchanged,
    /// Removed tables were retired without loading anything
    Reconciled { removed: usize },
    Loaded {
        loaded: usize,
        failed: usize,
        removed: usize,
    },
    /// The machine binding is gone; the view was cleared
    TornDown,
    /// Another replica held the fleet lock past the timeout
    LockUnavailable,
    /// The store answered with an older revision than already adopted
    StaleRevision,
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Unchanged => "unchanged",
            CycleOutcome::Reconciled { .. } => "reconciled",
            CycleOutcome::Loaded { .. } => "loaded",
            CycleOutcome::TornDown => "torn_down",
            CycleOutcome::LockUnavailable => "lock_unavailable",
            CycleOutcome::StaleRevision => "stale_revision",
        }
    }
}

enum JobKind {
    Reopen(PathBuf),
    Download,
}

struct LoadJob {
    desc: TableDescriptor,
    kind: JobKind,
}

/// Remote state of one database at one revision
struct Snapshot {
    revision: i64,
    database: DatabaseDescriptor,
    tables: Vec<TableDescriptor>,
    /// Every table name seen, including ones skipped this cycle
    present: HashSet<String>,
}

pub struct RefreshCoordinator {
    engine: Arc<Engine>,
    coordination: Arc<dyn CoordinationStore>,
    stores: Arc<dyn ObjectStoreFactory>,
    lock: FleetLock,
    registrar: Option<Arc<dyn ServiceRegistrar>>,
    config: EngineConfig,
    cycles: AtomicU64,
    running: Mutex<()>,
}

impl RefreshCoordinator {
    pub fn new(
        engine: Arc<Engine>,
        coordination: Arc<dyn CoordinationStore>,
        stores: Arc<dyn ObjectStoreFactory>,
        config: EngineConfig,
    ) -> Self {
        let lock = FleetLock::new(Arc::clone(&coordination), config.machine_id.clone())
            .with_ttl(config.lock_ttl)
            .with_timeout(config.lock_timeout);
        Self {
            engine,
            coordination,
            stores,
            lock,
            registrar: None,
            config,
            cycles: AtomicU64::new(0),
            running: Mutex::new(()),
        }
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn ServiceRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs one reconciliation cycle
    ///
    /// Concurrent calls are serialized.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let _running = self.running.lock().await;

        let machine_key = keys::machine_key(&self.config.machine_id);
        let Some(binding) = self.coordination.get(&machine_key).await? else {
            return Ok(self.tear_down());
        };
        let binding: MachineBinding = binding.json()?;
        tracing::Span::current().record("database", binding.database.as_str());

        let snapshot = self.read_snapshot(&binding.database).await?;
        if snapshot.revision < self.engine.revision() {
            warn!(
                revision = snapshot.revision,
                adopted = self.engine.revision(),
                "Ignoring stale coordination read"
            );
            return Ok(CycleOutcome::StaleRevision);
        }

        let view = self.engine.view();
        let removals: Vec<String> = view
            .names()
            .filter(|name| !snapshot.present.contains(*name))
            .map(str::to_string)
            .collect();
        let jobs = self.plan_jobs(&snapshot.tables, &view);
        drop(view);

        if jobs.is_empty() {
            let removed = removals.len();
            if removed > 0 {
                self.retire(removals);
            }
            self.collect_garbage();
            self.engine.adopt_revision(snapshot.revision);
            return Ok(if removed > 0 {
                CycleOutcome::Reconciled { removed }
            } else {
                CycleOutcome::Unchanged
            });
        }

        let loader = if jobs.iter().any(|j| matches!(j.kind, JobKind::Download)) {
            let store = self.stores.create(&snapshot.database.storage)?;
            Some(self.loader(store))
        } else {
            None
        };

        let guard = match self.lock.acquire(&snapshot.database.name).await {
            Ok(guard) => guard,
            Err(Error::LockTimeout(key)) => {
                info!(key = %key, "Fleet lock busy; retrying next cycle");
                return Ok(CycleOutcome::LockUnavailable);
            }
            Err(e) => return Err(e),
        };

        let outcome = self
            .load_and_publish(&snapshot, jobs, removals, loader.as_ref())
            .await;
        guard.release().await;

        self.collect_garbage();
        self.engine.adopt_revision(snapshot.revision);
        Ok(outcome)
    }

    fn tear_down(&self) -> CycleOutcome {
        let retired = self.engine.clear();
        if !retired.is_empty() {
            warn!(
                machine_id = %self.config.machine_id,
                tables = retired.len(),
                "Machine binding removed; stopped serving"
            );
        }
        CycleOutcome::TornDown
    }

    async fn read_snapshot(&self, database: &str) -> Result<Snapshot> {
        let read = self
            .coordination
            .get_prefix(&keys::database_key(database))
            .await?;
        let database_key = keys::database_key(database);

        let mut descriptor = None;
        let mut tables = BTreeMap::new();
        let mut present = HashSet::new();
        for kv in &read.kvs {
            if kv.key == database_key {
                descriptor = Some(kv.json::<DatabaseDescriptor>()?);
                continue;
            }
            let Some(name) = keys::table_name(database, &kv.key) else {
                continue;
            };
            present.insert(name.to_string());
            match kv.json::<TableDescriptor>() {
                Ok(desc) if desc.name == name => {
                    tables.insert(name.to_string(), desc);
                }
                Ok(desc) => warn!(
                    key = %kv.key,
                    name = %desc.name,
                    "Table descriptor name does not match its key; skipping"
                ),
                Err(e) => warn!(key = %kv.key, error = %e, "Unreadable table descriptor; skipping"),
            }
        }

        let database = descriptor
            .ok_or_else(|| Error::NotFound(format!("database descriptor '{}'", database)))?;

        // A non-empty table list restricts what this database serves
        if !database.tables.is_empty() {
            let listed: HashSet<&str> = database.tables.iter().map(String::as_str).collect();
            tables.retain(|name, _| listed.contains(name.as_str()));
            present.retain(|name| listed.contains(name.as_str()));
        }

        Ok(Snapshot {
            revision: read.revision,
            database,
            tables: tables.into_values().collect(),
            present,
        })
    }

    fn plan_jobs(&self, tables: &[TableDescriptor], view: &crate::view::View) -> Vec<LoadJob> {
        let mut jobs = Vec::new();
        for desc in tables {
            let version = desc.current_version.as_str();
            if version.is_empty() {
                warn!(table = %desc.name, "Table has no current version; skipping");
                continue;
            }
            if let Err(e) = desc.check_local_names() {
                warn!(table = %desc.name, error = %e, "Unusable table descriptor; skipping");
                continue;
            }
            if view.get(&desc.name).is_some_and(|t| t.version() == version) {
                continue;
            }
            let kind = match local_manifest(&self.config.work_dir, &desc.name, version) {
                Some(path) => JobKind::Reopen(path),
                None => JobKind::Download,
            };
            jobs.push(LoadJob {
                desc: desc.clone(),
                kind,
            });
        }
        jobs
    }

    fn loader(&self, store: Arc<dyn ObjectStore>) -> ShardLoader {
        ShardLoader::new(&self.config.work_dir, store).with_retry(self.config.retry.clone())
    }

    fn table_options(&self, table_count: usize) -> TableOptions {
        TableOptions {
            cache_capacity: self.config.cache_capacity / table_count.max(1),
            cache_ttl: self.config.cache_ttl,
            pool_size: self.config.pool_size,
        }
    }

    async fn load_and_publish(
        &self,
        snapshot: &Snapshot,
        jobs: Vec<LoadJob>,
        removals: Vec<String>,
        loader: Option<&ShardLoader>,
    ) -> CycleOutcome {
        let database = snapshot.database.name.as_str();
        if let Some(registrar) = &self.registrar {
            if let Err(e) = registrar.deregister(database).await {
                warn!(database, error = %e, "Service deregistration failed");
            }
        }

        let status = self.engine.status();
        for job in &jobs {
            status.set(&job.desc.name, TableStatus::Loading);
        }

        let options = self.table_options(snapshot.tables.len());
        let results: Vec<(String, Result<Arc<Table>>)> = stream::iter(jobs)
            .map(|job| {
                let options = options.clone();
                async move {
                    let name = job.desc.name.clone();
                    (name, execute(job, loader, options).await)
                }
            })
            .buffer_unordered(self.config.max_concurrent_loads.max(1))
            .collect()
            .await;

        let view = self.engine.view();
        let mut upserts = Vec::new();
        let mut failed = 0;
        for (name, result) in results {
            match result {
                Ok(table) => {
                    status.set(&name, TableStatus::Serving);
                    upserts.push(table);
                }
                Err(e) => {
                    failed += 1;
                    observability::record_table_load_failure(&name);
                    error!(table = %name, error = %e, "Table load failed; keeping previous version");
                    if view.get(&name).is_some() {
                        status.set(&name, TableStatus::Serving);
                    } else {
                        status.remove(&name);
                    }
                }
            }
        }
        drop(view);

        let loaded = upserts.len();
        let removed = removals.len();
        for name in &removals {
            status.remove(name);
        }
        let retired = self.engine.apply(ViewUpdate { upserts, removals });
        for (name, version) in &retired {
            debug!(table = %name, version = %version, "Retired table");
        }

        if let Some(registrar) = &self.registrar {
            if let Err(e) = registrar.register(database).await {
                warn!(database, error = %e, "Service registration failed");
            }
        }

        info!(loaded, failed, removed, "Published refreshed view");
        CycleOutcome::Loaded {
            loaded,
            failed,
            removed,
        }
    }

    fn retire(&self, removals: Vec<String>) {
        for name in &removals {
            self.engine.status().remove(name);
        }
        let retired = self.engine.apply(ViewUpdate {
            upserts: Vec::new(),
            removals,
        });
        info!(removed = retired.len(), "Retired removed tables");
    }

    fn collect_garbage(&self) {
        let hold = gc::hold_set(&self.engine.view());
        if let Err(e) = gc::collect_garbage(&self.config.work_dir, &hold) {
            warn!(error = %e, "Garbage collection failed");
        }
    }

    /// Runs one cycle, containing errors and panics
    pub async fn run_guarded(&self) -> Option<CycleOutcome> {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let span = info_span!(
            "refresh_cycle",
            machine_id = %self.config.machine_id,
            database = tracing::field::Empty,
            cycle
        );

        let result = AssertUnwindSafe(self.run_cycle().instrument(span.clone()))
            .catch_unwind()
            .await;

        let _entered = span.enter();
        match result {
            Ok(Ok(outcome)) => {
                observability::record_cycle(outcome.label());
                debug!(outcome = outcome.label(), "Refresh cycle finished");
                Some(outcome)
            }
            Ok(Err(e)) => {
                observability::record_cycle_failure();
                error!(error = %e, "Refresh cycle failed; keeping current view");
                None
            }
            Err(_) => {
                observability::record_cycle_failure();
                error!("Refresh cycle panicked; keeping current view");
                None
            }
        }
    }

    /// Starts the refresh driver
    ///
    /// Runs a cycle immediately, then every `interval`. A slow cycle delays
    /// the next tick instead of overlapping it. The driver stops on shutdown
    /// after the cycle in flight, if any, completes.
    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                machine_id = %self.config.machine_id,
                interval_secs = self.config.interval.as_secs(),
                "Refresh driver started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        self.run_guarded().await;
                    }
                }
            }
            info!("Refresh driver stopped");
        })
    }
}

async fn execute(
    job: LoadJob,
    loader: Option<&ShardLoader>,
    options: TableOptions,
) -> Result<Arc<Table>> {
    let manifest_path = match job.kind {
        JobKind::Reopen(path) => {
            debug!(table = %job.desc.name, "Reopening complete local version");
            path
        }
        JobKind::Download => {
            let loader =
                loader.ok_or_else(|| Error::internal("download job without an object store"))?;
            loader.load(&job.desc).await?
        }
    };
    open_table(manifest_path, options).await
}

async fn open_table(manifest_path: PathBuf, options: TableOptions) -> Result<Arc<Table>> {
    tokio::task::spawn_blocking(move || Table::open(Path::new(&manifest_path), &options))
        .await
        .map_err(|e| Error::internal(format!("table open task failed: {}", e)))?
        .map(Arc::new)
}
