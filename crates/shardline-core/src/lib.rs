//! # Shardline Core Library
//!
//! Types and traits shared by the serving engine and its outer surfaces.
//! Nothing in this crate holds engine state; it defines what the engine
//! reads (descriptors, manifests, encoded rows) and the interfaces it reads
//! them through (object storage, coordination store).
//!
//! ## Key Components
//!
//! - **codec**: compact binary encoding of one row of typed values
//! - **model**: database/table descriptors, manifests, coordination keys
//! - **merge**: strategies for combining per-table fragments of one key
//! - **storage** / **coordination**: external-interface traits with
//!   in-tree implementations
//! - **lock**: lease-backed fleet lock on top of the coordination store
//! - **status**: per-table load state for readiness
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use shardline_core::codec::{decode, RowEncoder};
//!
//! let mut row = RowEncoder::new(2)?;
//! row.push_int64(31)?;
//! row.push_bytes(b"berlin")?;
//! let buf = row.finish()?;
//! for field in decode(&buf)? {
//!     println!("{:?}", field?.field_type);
//! }
//! ```

pub use error::{Error, Result};
pub use merge::{JsonMergeOperator, MapMergeOperator, MergeOperator};
pub use model::{
    ColumnSchema, DataType, DatabaseDescriptor, FeatureSpec, MachineBinding, Manifest,
    StorageLocation, StoreType, TableDescriptor,
};
pub use status::{StatusTracker, TableStatus};
pub use value::FeatureValue;

pub mod codec;
pub mod coordination;
mod error;
pub mod lock;
pub mod merge;
pub mod model;
pub mod retry;
pub mod status;
pub mod storage;
pub mod value;

pub mod prelude {
    pub use crate::coordination::{CoordinationStore, MemoryCoordinationStore};
    pub use crate::error::{Error, Result};
    pub use crate::lock::{FleetLock, FleetLockGuard};
    pub use crate::merge::{JsonMergeOperator, MapMergeOperator, MergeOperator};
    pub use crate::model::{DatabaseDescriptor, Manifest, TableDescriptor};
    pub use crate::storage::{DefaultObjectStoreFactory, ObjectStore, ObjectStoreFactory};
    pub use crate::value::FeatureValue;
}
