//! Error types for Shardline
//!
//! Every fallible operation in the core and engine crates returns this error.
//! The variants follow how a failure is handled, not where it came from:
//!
//! - `NotFound` is a normal empty result on the read path.
//! - `RemoteUnavailable` keeps the previous state and retries next cycle.
//! - `IncompleteLocalState` forces a re-download, never a serve.
//! - `ShardOpenFailure` aborts one table's rebuild for one cycle.

use thiserror::Error;

/// Result type alias for operations that can fail
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors that can occur in Shardline
#[derive(Error, Debug)]
pub enum Error {
    /// Key, table or remote object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Coordination store or object storage could not be reached
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// A local version directory is missing its marker or has an unusable manifest
    #[error("Incomplete local state: {0}")]
    IncompleteLocalState(String),

    /// One shard file of a table could not be opened
    #[error("Failed to open shard '{path}': {reason}")]
    ShardOpenFailure { path: String, reason: String },

    /// An encoded row is malformed or was built out of order
    #[error("Codec error: {0}")]
    Codec(String),

    /// A manifest or descriptor is structurally invalid
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// The fleet lock could not be acquired within its timeout
    #[error("Timed out acquiring lock '{0}'")]
    LockTimeout(String),

    /// Storage backend error (filesystem, SQLite, object storage)
    #[error("Storage error: {0}")]
    StorageError(#[from] anyhow::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Invalid input from a caller
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error - indicates a bug
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl Error {
    /// Creates a RemoteUnavailable error from a message
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::RemoteUnavailable(msg.into())
    }

    /// Creates an IncompleteLocalState error from a message
    pub fn incomplete(msg: impl Into<String>) -> Self {
        Self::IncompleteLocalState(msg.into())
    }

    /// Creates a Codec error from a message
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Creates an InvalidManifest error from a message
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::InvalidManifest(msg.into())
    }

    /// Creates a ConfigError from a message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Creates an InvalidInput error from a message
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Creates an InternalError from a message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }

    /// Wraps an I/O error with the path it happened on
    pub fn io(path: impl AsRef<std::path::Path>, err: std::io::Error) -> Self {
        Self::StorageError(anyhow::anyhow!(
            "I/O error on '{}': {}",
            path.as_ref().display(),
            err
        ))
    }

    /// Whether retrying the same operation may succeed
    ///
    /// Only transient remote failures qualify. Missing objects, bad manifests
    /// and codec errors fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RemoteUnavailable(_) => true,
            Error::StorageError(e) => {
                let msg = e.to_string().to_lowercase();
                msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("connection")
                    || msg.contains("temporar")
                    || msg.contains("unavailable")
            }
            _ => false,
        }
    }

    /// Whether the error is a normal miss rather than a failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
