//! Configuration management
//!
//! The server reads one YAML file. Every section is optional; a missing
//! file means all defaults.
//!
//! ```yaml
//! server:
//!   host: "0.0.0.0"
//!   port: 8000
//!
//! engine:
//!   machine_id: "replica-1"
//!   work_dir: "/var/lib/shardline"
//!   cache_capacity: 100000
//!   refresh_interval_secs: 30
//!
//! catalog:
//!   database:
//!     name: "ads"
//!     storage: { provider: "local", bucket: "/data/bucket" }
//!   tables:
//!     - name: "profile"
//!       ...
//! ```
//!
//! Instead of the inline `catalog`, `catalog_file` names a YAML file with the
//! same shape that is re-read on every refresh cycle, so publishing a new
//! table version only needs an edit to that file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use shardline_core::coordination::MemoryCoordinationStore;
use shardline_core::model::keys;
use shardline_core::{DatabaseDescriptor, MachineBinding, TableDescriptor};
use shardline_engine::EngineConfig;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub engine: EngineSection,

    /// Static seed for the in-process coordination store
    #[serde(default)]
    pub catalog: Option<Catalog>,

    /// Catalog re-read every cycle; wins over `catalog`
    #[serde(default)]
    pub catalog_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Whole-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Time the refresh driver gets to finish its cycle on shutdown
    #[serde(default = "default_grace_period_secs")]
    pub shutdown_grace_secs: u64,
}

/// Engine settings as they appear in the file
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineSection {
    pub machine_id: String,
    pub work_dir: PathBuf,
    pub cache_capacity: usize,
    /// 0 disables expiry
    pub cache_ttl_secs: u64,
    pub refresh_interval_secs: u64,
    pub lock_timeout_secs: u64,
    pub lock_ttl_secs: u64,
    pub max_concurrent_loads: usize,
    pub pool_size: u32,
    /// 0 disables the lookup timeout
    pub query_timeout_ms: u64,
}

/// Coordination state to publish at startup
///
/// The catalog binds this machine to `database` and writes its
/// descriptors, as an external operator would.
#[derive(Debug, Deserialize, Clone)]
pub struct Catalog {
    pub database: DatabaseDescriptor,
    #[serde(default)]
    pub tables: Vec<TableDescriptor>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_grace_period_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout_secs(),
            shutdown_grace_secs: default_grace_period_secs(),
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            machine_id: engine.machine_id,
            work_dir: engine.work_dir,
            cache_capacity: engine.cache_capacity,
            cache_ttl_secs: 0,
            refresh_interval_secs: engine.interval.as_secs(),
            lock_timeout_secs: engine.lock_timeout.as_secs(),
            lock_ttl_secs: engine.lock_ttl.as_secs(),
            max_concurrent_loads: engine.max_concurrent_loads,
            pool_size: engine.pool_size,
            query_timeout_ms: engine
                .query_timeout
                .map(|t| t.as_millis() as u64)
                .unwrap_or(0),
        }
    }
}

impl EngineSection {
    pub fn engine_config(&self) -> EngineConfig {
        let nonzero_secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));
        EngineConfig {
            machine_id: self.machine_id.clone(),
            work_dir: self.work_dir.clone(),
            cache_capacity: self.cache_capacity,
            cache_ttl: nonzero_secs(self.cache_ttl_secs),
            interval: Duration::from_secs(self.refresh_interval_secs.max(1)),
            lock_timeout: Duration::from_secs(self.lock_timeout_secs),
            lock_ttl: Duration::from_secs(self.lock_ttl_secs.max(1)),
            max_concurrent_loads: self.max_concurrent_loads.max(1),
            pool_size: self.pool_size.max(1),
            query_timeout: (self.query_timeout_ms > 0)
                .then(|| Duration::from_millis(self.query_timeout_ms)),
            ..EngineConfig::default()
        }
    }
}

impl Catalog {
    /// Every table must belong to the catalog's database
    pub fn validate(&self) -> shardline_core::Result<()> {
        let database = &self.database.name;
        for table in &self.tables {
            if table.database != *database {
                return Err(shardline_core::Error::config(format!(
                    "table '{}' belongs to database '{}', catalog seeds '{}'",
                    table.name, table.database, database
                )));
            }
        }
        Ok(())
    }

    /// Writes the binding and descriptors for `machine_id` into `store`
    pub fn seed(
        &self,
        store: &MemoryCoordinationStore,
        machine_id: &str,
    ) -> shardline_core::Result<()> {
        self.validate()?;
        let database = &self.database.name;
        store.put_json(
            &keys::machine_key(machine_id),
            &MachineBinding {
                database: database.clone(),
            },
        )?;
        store.put_json(&keys::database_key(database), &self.database)?;
        for table in &self.tables {
            store.put_json(&keys::table_key(database, &table.name), table)?;
        }
        tracing::info!(
            database = %database,
            tables = self.tables.len(),
            "Seeded coordination store from catalog"
        );
        Ok(())
    }

    /// Like [`seed`](Self::seed), also deleting tables the catalog no longer lists
    pub fn sync(
        &self,
        store: &MemoryCoordinationStore,
        machine_id: &str,
    ) -> shardline_core::Result<()> {
        self.validate()?;
        let database = &self.database.name;
        let listed: HashSet<String> = self
            .tables
            .iter()
            .map(|t| keys::table_key(database, &t.name))
            .collect();
        let prefix = format!("{}/", keys::database_key(database));
        for key in store.keys_with_prefix(&prefix) {
            if !listed.contains(&key) {
                store.delete(&key);
                tracing::info!(key = %key, "Table dropped from catalog");
            }
        }
        self.seed(store, machine_id)
    }
}

/// Loads configuration from a YAML file
///
/// A missing file yields the defaults.
pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        tracing::warn!(
            "Configuration file '{}' not found, using defaults",
            path.display()
        );
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&contents)?;

    tracing::info!("Loaded configuration from {}", path.display());
    Ok(config)
}
