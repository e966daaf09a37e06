//! Shared fixtures: a local bucket, a working directory and an in-memory
//! coordination store wired to one engine.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tempfile::TempDir;

use shardline_core::coordination::MemoryCoordinationStore;
use shardline_core::model::keys;
use shardline_core::retry::RetryPolicy;
use shardline_core::storage::DefaultObjectStoreFactory;
use shardline_core::{
    DataType, DatabaseDescriptor, FeatureSpec, MachineBinding, Manifest, StorageLocation,
    StoreType, TableDescriptor,
};
use shardline_engine::{shard_index, Engine, EngineConfig, RefreshCoordinator};

pub const DATABASE: &str = "ads";
pub const MACHINE: &str = "replica-1";

pub struct Fixture {
    pub bucket: TempDir,
    pub work: TempDir,
    pub store: Arc<MemoryCoordinationStore>,
}

impl Fixture {
    /// A bound machine and an empty database
    pub fn new() -> Self {
        let fixture = Self {
            bucket: TempDir::new().unwrap(),
            work: TempDir::new().unwrap(),
            store: Arc::new(MemoryCoordinationStore::new()),
        };
        fixture.bind(MACHINE);
        fixture
            .store
            .put_json(
                &keys::database_key(DATABASE),
                &DatabaseDescriptor {
                    name: DATABASE.to_string(),
                    storage: StorageLocation {
                        provider: "local".to_string(),
                        bucket: fixture.bucket.path().display().to_string(),
                        endpoint: None,
                        region: None,
                        credentials: None,
                    },
                    tables: Vec::new(),
                    revision: None,
                },
            )
            .unwrap();
        fixture
    }

    pub fn config(&self, machine: &str) -> EngineConfig {
        EngineConfig {
            machine_id: machine.to_string(),
            work_dir: self.work.path().to_path_buf(),
            cache_capacity: 64,
            interval: Duration::from_millis(50),
            lock_timeout: Duration::from_millis(200),
            lock_ttl: Duration::from_secs(5),
            retry: RetryPolicy::none(),
            ..EngineConfig::default()
        }
    }

    pub fn coordinator(&self) -> (Arc<Engine>, RefreshCoordinator) {
        self.coordinator_for(MACHINE)
    }

    pub fn coordinator_for(&self, machine: &str) -> (Arc<Engine>, RefreshCoordinator) {
        let config = self.config(machine);
        let engine = Arc::new(config.build_engine());
        let coordinator = RefreshCoordinator::new(
            Arc::clone(&engine),
            self.store.clone(),
            Arc::new(DefaultObjectStoreFactory),
            config,
        );
        (engine, coordinator)
    }

    pub fn bind(&self, machine: &str) {
        self.store
            .put_json(
                &keys::machine_key(machine),
                &MachineBinding {
                    database: DATABASE.to_string(),
                },
            )
            .unwrap();
    }

    pub fn unbind(&self, machine: &str) {
        self.store.delete(&keys::machine_key(machine));
    }

    pub fn version_dir(&self, table: &str, version: &str) -> PathBuf {
        self.work.path().join(table).join(version)
    }

    /// Publishes `table` at `version` and points its descriptor at it
    ///
    /// Every row has the key column `uid` and one integer feature named
    /// `{table}_score`.
    pub fn publish(&self, table: &str, version: &str, shards: usize, rows: &[(&str, i64)]) {
        let data_dir = format!("{}/data/{}", table, version);
        let partitions = write_shards(&self.bucket.path().join(&data_dir), table, shards, rows);
        let partitions: Vec<String> = partitions
            .iter()
            .map(|p| format!("{}/{}", data_dir, p))
            .collect();

        let manifest = Manifest {
            name: table.to_string(),
            partitions,
            version: version.to_string(),
            key_column: "uid".to_string(),
            features: features(table),
        };
        let meta_dir = self.bucket.path().join(table).join("meta");
        std::fs::create_dir_all(&meta_dir).unwrap();
        manifest.write_to(meta_dir.join(version)).unwrap();

        self.store
            .put_json(
                &keys::table_key(DATABASE, table),
                &TableDescriptor {
                    name: table.to_string(),
                    database: DATABASE.to_string(),
                    data_dir,
                    meta_dir: format!("{}/meta", table),
                    versions: vec![version.to_string()],
                    current_version: version.to_string(),
                    partitions: shards,
                    key_column: "uid".to_string(),
                    features: features(table),
                },
            )
            .unwrap();
    }

    pub fn drop_table(&self, table: &str) {
        self.store.delete(&keys::table_key(DATABASE, table));
    }
}

pub fn features(table: &str) -> BTreeMap<String, FeatureSpec> {
    let mut features = BTreeMap::new();
    features.insert(
        "uid".to_string(),
        FeatureSpec {
            data_type: DataType::String,
            store_type: StoreType::Text,
            separator: None,
        },
    );
    features.insert(
        format!("{}_score", table),
        FeatureSpec {
            data_type: DataType::Int64,
            store_type: StoreType::Integer,
            separator: None,
        },
    );
    features
}

/// Writes SQLite shard files routed with the engine's shard function
pub fn write_shards(dir: &Path, table: &str, shards: usize, rows: &[(&str, i64)]) -> Vec<String> {
    std::fs::create_dir_all(dir).unwrap();
    let names: Vec<String> = (0..shards).map(|i| format!("{}.db", i)).collect();
    let conns: Vec<Connection> = names
        .iter()
        .map(|name| {
            let conn = Connection::open(dir.join(name)).unwrap();
            conn.execute_batch(&format!(
                "CREATE TABLE \"{t}\" (uid TEXT PRIMARY KEY, \"{t}_score\" INTEGER)",
                t = table
            ))
            .unwrap();
            conn
        })
        .collect();
    for (uid, score) in rows {
        let conn = &conns[shard_index(uid.as_bytes(), shards)];
        conn.execute(
            &format!("INSERT INTO \"{t}\" (uid, \"{t}_score\") VALUES (?1, ?2)", t = table),
            rusqlite::params![uid, score],
        )
        .unwrap();
    }
    names
}
