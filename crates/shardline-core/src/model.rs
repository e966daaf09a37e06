//! Descriptors, manifests and the coordination key space
//!
//! Descriptors are published by the offline pipeline into the coordination
//! store. A [`Manifest`] is the durable per-version artifact that travels
//! with the shard files; its local copy plus the completeness marker is the
//! commit point of a loaded version.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Logical type of a feature column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Int64,
    Float32,
    StringList,
    Int64List,
    Float32List,
}

impl DataType {
    pub fn is_list(&self) -> bool {
        matches!(
            self,
            DataType::StringList | DataType::Int64List | DataType::Float32List
        )
    }

    /// Scalar type of the list elements, or the type itself for scalars
    pub fn element(&self) -> DataType {
        match self {
            DataType::StringList => DataType::String,
            DataType::Int64List => DataType::Int64,
            DataType::Float32List => DataType::Float32,
            scalar => *scalar,
        }
    }
}

/// Physical storage class of a column inside a shard file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreType {
    Text,
    Integer,
    Real,
    Blob,
}

/// Schema entry of one feature column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub data_type: DataType,
    pub store_type: StoreType,
    /// Delimiter of legacy list columns stored as a single text value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
}

/// A named column in encoding order
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub spec: FeatureSpec,
}

/// Per-version table manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub partitions: Vec<String>,
    pub version: String,
    pub key_column: String,
    #[serde(default)]
    pub features: BTreeMap<String, FeatureSpec>,
}

impl Manifest {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Reads and validates a manifest from disk
    ///
    /// A missing or unparsable file is reported as incomplete local state.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            Error::incomplete(format!("cannot read manifest '{}': {}", path.display(), e))
        })?;
        Self::from_slice(&bytes).map_err(|e| {
            Error::incomplete(format!("unusable manifest '{}': {}", path.display(), e))
        })
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, bytes).map_err(|e| Error::io(path, e))
    }

    /// Columns in encoding order, key column excluded
    pub fn columns(&self) -> Vec<ColumnSchema> {
        self.features
            .iter()
            .filter(|(name, _)| **name != self.key_column)
            .map(|(name, spec)| ColumnSchema {
                name: name.clone(),
                spec: spec.clone(),
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::manifest("table name is empty"));
        }
        if self.version.is_empty() {
            return Err(Error::manifest(format!("table '{}' has no version", self.name)));
        }
        if self.key_column.is_empty() {
            return Err(Error::manifest(format!(
                "table '{}' has no key column",
                self.name
            )));
        }
        if self.partitions.is_empty() {
            return Err(Error::manifest(format!(
                "table '{}' version '{}' has no partitions",
                self.name, self.version
            )));
        }
        for (column, spec) in &self.features {
            if spec.separator.as_deref() == Some("") {
                return Err(Error::manifest(format!(
                    "column '{}' has an empty separator",
                    column
                )));
            }
        }
        Ok(())
    }
}

/// Object storage location of a database's artifacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageLocation {
    pub provider: String,
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Name of a credentials entry, never the secret itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseDescriptor {
    pub name: String,
    pub storage: StorageLocation,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

/// Which database a serving machine is bound to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineBinding {
    pub database: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub database: String,
    pub data_dir: String,
    pub meta_dir: String,
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub current_version: String,
    #[serde(default)]
    pub partitions: usize,
    pub key_column: String,
    #[serde(default)]
    pub features: BTreeMap<String, FeatureSpec>,
}

impl TableDescriptor {
    /// Checks that the name and current version are usable as directory names
    pub fn check_local_names(&self) -> Result<()> {
        for (what, value) in [("table name", &self.name), ("version", &self.current_version)] {
            if !is_path_segment(value) {
                return Err(Error::invalid_input(format!(
                    "{} '{}' is not a single path segment",
                    what, value
                )));
            }
        }
        Ok(())
    }

    /// Object key of the manifest for `version`
    pub fn manifest_key(&self, version: &str) -> String {
        format!("{}/{}", self.meta_dir.trim_end_matches('/'), version)
    }
}

/// True for a non-empty name that maps to exactly one normal path component
pub fn is_path_segment(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(c)), None) if c == std::ffi::OsStr::new(name)
    )
}

/// Coordination-store key layout
pub mod keys {
    pub const ROOT: &str = "/shardline";

    pub fn machine_key(machine_id: &str) -> String {
        format!("{}/storage/machines/{}", ROOT, machine_id)
    }

    pub fn database_key(database: &str) -> String {
        format!("{}/storage/databases/{}", ROOT, database)
    }

    pub fn table_key(database: &str, table: &str) -> String {
        format!("{}/{}", database_key(database), table)
    }

    pub fn lock_key(database: &str) -> String {
        format!("{}/locks/{}", ROOT, database)
    }

    /// Table name for a key read under `database_key(database)`
    ///
    /// Returns `None` for the descriptor key itself, for sibling databases
    /// sharing the prefix, and for anything nested deeper than one level.
    pub fn table_name<'a>(database: &str, key: &'a str) -> Option<&'a str> {
        let prefix = database_key(database);
        let rest = key.strip_prefix(prefix.as_str())?.strip_prefix('/')?;
        if !super::is_path_segment(rest) {
            return None;
        }
        Some(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_json() -> &'static str {
        r#"{
            "name": "profile",
            "partitions": ["profile/v1/0.db", "profile/v1/1.db"],
            "version": "v1",
            "key_column": "user_id",
            "features": {
                "user_id": {"data_type": "string", "store_type": "text"},
                "tags": {"data_type": "string_list", "store_type": "text", "separator": ","},
                "age": {"data_type": "int64", "store_type": "integer"}
            }
        }"#
    }

    #[test]
    fn test_manifest_parse_and_columns() {
        let manifest = Manifest::from_slice(manifest_json().as_bytes()).unwrap();
        assert_eq!(manifest.partitions.len(), 2);

        let columns = manifest.columns();
        let names: Vec<_> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["age", "tags"]);
        assert_eq!(columns[1].spec.separator.as_deref(), Some(","));
        assert!(columns[1].spec.data_type.is_list());
        assert_eq!(columns[1].spec.data_type.element(), DataType::String);
    }

    #[test]
    fn test_manifest_validation() {
        let mut manifest = Manifest::from_slice(manifest_json().as_bytes()).unwrap();
        manifest.partitions.clear();
        assert!(matches!(manifest.validate(), Err(Error::InvalidManifest(_))));

        let bad = r#"{"name": "t", "partitions": ["a"], "version": "", "key_column": "k"}"#;
        assert!(Manifest::from_slice(bad.as_bytes()).is_err());
    }

    #[test]
    fn test_manifest_file_roundtrip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");

        assert!(matches!(
            Manifest::from_file(&path),
            Err(Error::IncompleteLocalState(_))
        ));

        let manifest = Manifest::from_slice(manifest_json().as_bytes()).unwrap();
        manifest.write_to(&path).unwrap();
        assert_eq!(Manifest::from_file(&path).unwrap(), manifest);

        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            Manifest::from_file(&path),
            Err(Error::IncompleteLocalState(_))
        ));
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(
            keys::machine_key("10.0.0.1"),
            "/shardline/storage/machines/10.0.0.1"
        );
        assert_eq!(
            keys::table_key("ads", "profile"),
            "/shardline/storage/databases/ads/profile"
        );
        assert_eq!(keys::lock_key("ads"), "/shardline/locks/ads");
    }

    #[test]
    fn test_table_name_from_key() {
        let db = keys::database_key("ads");
        assert_eq!(keys::table_name("ads", &format!("{}/profile", db)), Some("profile"));
        assert_eq!(keys::table_name("ads", &db), None);
        assert_eq!(keys::table_name("ads", "/shardline/storage/databases/ads2/x"), None);
        assert_eq!(keys::table_name("ads", &format!("{}/a/b", db)), None);
        assert_eq!(keys::table_name("ads", &format!("{}/..", db)), None);
        assert_eq!(keys::table_name("ads", &format!("{}/.", db)), None);
    }

    #[test]
    fn test_table_descriptor_manifest_key() {
        let desc: TableDescriptor = serde_json::from_str(
            r#"{"name": "profile", "database": "ads", "data_dir": "profile/data",
                "meta_dir": "profile/meta/", "current_version": "v2", "key_column": "user_id"}"#,
        )
        .unwrap();
        assert_eq!(desc.manifest_key("v2"), "profile/meta/v2");
        assert!(desc.versions.is_empty());
    }

    #[test]
    fn test_local_names_must_be_single_segments() {
        let mut desc: TableDescriptor = serde_json::from_str(
            r#"{"name": "profile", "database": "ads", "data_dir": "d", "meta_dir": "m",
                "current_version": "v2", "key_column": "uid"}"#,
        )
        .unwrap();
        assert!(desc.check_local_names().is_ok());

        for bad in ["..", ".", "", "v2/../..", "/abs", "v2/"] {
            desc.current_version = bad.to_string();
            assert!(
                matches!(desc.check_local_names(), Err(Error::InvalidInput(_))),
                "version {:?} accepted",
                bad
            );
        }

        desc.current_version = "v2".into();
        desc.name = "..".into();
        assert!(desc.check_local_names().is_err());
        assert!(is_path_segment("2024-01-01.v3"));
    }
}
