//! Sharded read-only tables
//!
//! A [`Table`] serves one version of one named table. Rows live in N shard
//! files; a key is routed to exactly one shard by a fixed hash, so every
//! replica and every restart agrees on where a key lives.
//!
//! ## Lifetime
//!
//! Tables are shared as `Arc<Table>`. The published view owns one strong
//! reference; every lookup holds another while it runs. Retiring a table
//! ([`Table::lazy_free`]) only drops the view's reference. Shard pools close
//! in `Drop`, i.e. after the last in-flight lookup finished.
//!
//! ## Shard access
//!
//! Each shard is a SQLite file behind its own small r2d2 pool of read-only
//! connections, all opened up front and held until the table drops.
//! Construction checks every shard first; one failure aborts the whole table
//! and closes what was already opened.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use r2d2::{ManageConnection, Pool};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};

use shardline_core::codec::RowEncoder;
use shardline_core::value::row_values;
use shardline_core::{ColumnSchema, DataType, Error, FeatureValue, Manifest, Result};

use crate::cache::RowCache;

/// 64-bit routing hash of a key
///
/// The low half of MurmurHash3 x64/128 with seed 0, the value the offline
/// partitioner's `Sum64` produces for the same bytes.
pub fn key_hash(key: &[u8]) -> u64 {
    // reading from an in-memory slice cannot fail
    murmur3::murmur3_x64_128(&mut Cursor::new(key), 0).map_or(0, |hash| hash as u64)
}

/// Shard index for `key` among `shard_count` shards
pub fn shard_index(key: &[u8], shard_count: usize) -> usize {
    if shard_count <= 1 {
        return 0;
    }
    (key_hash(key) % shard_count as u64) as usize
}

/// Source of encoded rows for one table version
///
/// The refresh path never looks behind this trait, so other storage
/// layouts can be added without touching it. Dropping the source closes it.
pub trait RowSource: Send + Sync {
    /// Encoded row for `key`, or `None` when no row matches
    fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn shard_count(&self) -> usize;
}

/// r2d2 manager for read-only SQLite connections to one shard file
#[derive(Debug)]
pub struct ReadOnlySqlite {
    path: PathBuf,
}

impl ReadOnlySqlite {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open(&self) -> rusqlite::Result<Connection> {
        Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }
}

impl ManageConnection for ReadOnlySqlite {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> rusqlite::Result<Connection> {
        self.open()
    }

    fn is_valid(&self, conn: &mut Connection) -> rusqlite::Result<()> {
        conn.query_row("SELECT 1", [], |_| Ok(()))
    }

    fn has_broken(&self, _conn: &mut Connection) -> bool {
        false
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// SQLite-backed shards of one table version
pub struct SqliteShards {
    pools: Vec<Pool<ReadOnlySqlite>>,
    paths: Vec<PathBuf>,
    sql: String,
    key_column: String,
    columns: Vec<ColumnSchema>,
}

impl SqliteShards {
    /// Opens every shard, failing as a whole on the first unusable one
    pub fn open(
        paths: &[PathBuf],
        table: &str,
        key_column: &str,
        columns: Vec<ColumnSchema>,
        pool_size: u32,
    ) -> Result<Self> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?1 LIMIT 1",
            quote_ident(table),
            quote_ident(key_column)
        );

        let mut pools = Vec::with_capacity(paths.len());
        for path in paths {
            let manager = ReadOnlySqlite::new(path);
            Self::check_shard(&manager, &sql).map_err(|e| Error::ShardOpenFailure {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

            // all connections open here and live as long as the table
            let size = pool_size.max(1);
            let pool = Pool::builder()
                .max_size(size)
                .min_idle(Some(size))
                .idle_timeout(None)
                .max_lifetime(None)
                .connection_timeout(Duration::from_secs(5))
                .build(manager)
                .map_err(|e| Error::ShardOpenFailure {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            pools.push(pool);
        }

        debug!(table, shards = pools.len(), "Opened shard pools");
        Ok(Self {
            pools,
            paths: paths.to_vec(),
            sql,
            key_column: key_column.to_string(),
            columns,
        })
    }

    /// Opens the file and compiles the lookup query against it
    fn check_shard(manager: &ReadOnlySqlite, sql: &str) -> rusqlite::Result<()> {
        let conn = manager.open()?;
        conn.query_row("PRAGMA schema_version", [], |_| Ok(()))?;
        conn.prepare(sql)?;
        Ok(())
    }

    fn encode(&self, names: &[String], row: &rusqlite::Row<'_>) -> Result<Vec<u8>> {
        let mut encoder = RowEncoder::new(self.columns.len())?;
        for column in &self.columns {
            let value = match names.iter().position(|n| *n == column.name) {
                Some(idx) => row.get_ref(idx).map_err(|e| {
                    Error::StorageError(anyhow::anyhow!(
                        "reading column '{}': {}",
                        column.name,
                        e
                    ))
                })?,
                None => ValueRef::Null,
            };
            push_value(&mut encoder, column.spec.data_type, value)?;
        }
        encoder.finish()
    }
}

fn push_value(encoder: &mut RowEncoder, data_type: DataType, value: ValueRef<'_>) -> Result<()> {
    match value {
        ValueRef::Null => encoder.push_none(),
        ValueRef::Integer(i) => match data_type {
            DataType::Float32 => encoder.push_float32(i as f32),
            DataType::Int64 => encoder.push_int64(i),
            _ => encoder.push_bytes(i.to_string().as_bytes()),
        },
        ValueRef::Real(f) => match data_type {
            DataType::Int64 => encoder.push_int64(f as i64),
            DataType::Float32 => encoder.push_float32(f as f32),
            _ => encoder.push_bytes(f.to_string().as_bytes()),
        },
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => encoder.push_bytes(bytes),
    }
}

impl RowSource for SqliteShards {
    fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let shard = shard_index(key.as_bytes(), self.pools.len());
        let conn = self.pools[shard].get().map_err(|e| {
            Error::StorageError(anyhow::anyhow!(
                "no connection for shard '{}': {}",
                self.paths[shard].display(),
                e
            ))
        })?;

        let query_err = |e: rusqlite::Error| {
            Error::StorageError(anyhow::anyhow!(
                "lookup on '{}' by {} failed: {}",
                self.paths[shard].display(),
                self.key_column,
                e
            ))
        };

        let mut stmt = conn.prepare_cached(&self.sql).map_err(query_err)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        stmt.query_row([key], |row| Ok(self.encode(&names, row)))
            .optional()
            .map_err(query_err)?
            .transpose()
    }

    fn shard_count(&self) -> usize {
        self.pools.len()
    }
}

/// Per-table construction options
#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Rows kept in the table's cache; 0 disables it
    pub cache_capacity: usize,
    pub cache_ttl: Option<Duration>,
    /// Connections per shard
    pub pool_size: u32,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            cache_capacity: 0,
            cache_ttl: None,
            pool_size: 4,
        }
    }
}

/// One live version of a named table
pub struct Table {
    name: String,
    version: String,
    dir: PathBuf,
    columns: Vec<ColumnSchema>,
    source: Box<dyn RowSource>,
    cache: Option<RowCache>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("dir", &self.dir)
            .field("shards", &self.source.shard_count())
            .finish()
    }
}

impl Table {
    /// Opens the table described by a local manifest
    ///
    /// Relative partition paths resolve against the manifest's directory.
    pub fn open(manifest_path: &Path, options: &TableOptions) -> Result<Self> {
        let manifest = Manifest::from_file(manifest_path)?;
        let dir = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let paths: Vec<PathBuf> = manifest
            .partitions
            .iter()
            .map(|p| dir.join(p))
            .collect();

        let shards = SqliteShards::open(
            &paths,
            &manifest.name,
            &manifest.key_column,
            manifest.columns(),
            options.pool_size,
        )?;

        let table = Self::with_source(&manifest, dir, Box::new(shards), options);
        info!(
            table = %table.name,
            version = %table.version,
            shards = table.source.shard_count(),
            cache = options.cache_capacity,
            "Table opened"
        );
        Ok(table)
    }

    /// Builds a table over an arbitrary row source
    pub fn with_source(
        manifest: &Manifest,
        dir: PathBuf,
        source: Box<dyn RowSource>,
        options: &TableOptions,
    ) -> Self {
        Self {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            dir,
            columns: manifest.columns(),
            source,
            cache: RowCache::new(options.cache_capacity, options.cache_ttl),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Local version directory backing this table
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn shard_count(&self) -> usize {
        self.source.shard_count()
    }

    /// Encoded row for `key`; `Ok(None)` is a normal miss
    pub fn get(&self, key: &str) -> Result<Option<Arc<[u8]>>> {
        if let Some(cache) = &self.cache {
            if let Some(row) = cache.get(key.as_bytes()) {
                return Ok(Some(row));
            }
        }

        let Some(row) = self.source.fetch(key)? else {
            return Ok(None);
        };
        let row: Arc<[u8]> = row.into();
        if let Some(cache) = &self.cache {
            cache.insert(key.as_bytes(), Arc::clone(&row));
        }
        Ok(Some(row))
    }

    /// Typed values for `key`, keyed by column name
    pub fn get_values(
        &self,
        key: &str,
    ) -> Result<Option<std::collections::BTreeMap<String, FeatureValue>>> {
        match self.get(key)? {
            Some(row) => row_values(&row, &self.columns).map(Some),
            None => Ok(None),
        }
    }

    /// Drops the owning reference held by a view
    ///
    /// Shards close once the last in-flight lookup releases its reference.
    pub fn lazy_free(self: Arc<Self>) {
        let remaining = Arc::strong_count(&self) - 1;
        if remaining > 0 {
            debug!(
                table = %self.name,
                version = %self.version,
                in_flight = remaining,
                "Table retired; closing after in-flight lookups"
            );
        }
        drop(self);
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        info!(table = %self.name, version = %self.version, "Table closed");
    }
}

/// Logs and swallows a lookup error, turning it into a miss
pub(crate) fn miss_on_error<T>(table: &str, result: Result<Option<T>>) -> Option<T> {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!(table, error = %e, "Lookup failed; treating as miss");
            None
        }
    }
}
