//! # Shardline Engine
//!
//! Hot-reloading storage engine behind the Shardline read path.
//!
//! - [`Engine`] holds the published [`View`] and answers lookups.
//! - [`RefreshCoordinator`] keeps the view in line with the coordination
//!   store: it downloads new versions ([`ShardLoader`]), opens them as
//!   [`Table`]s, swaps the view and collects garbage.
//!
//! ```rust,ignore
//! let engine = Arc::new(config.build_engine());
//! let coordinator = Arc::new(RefreshCoordinator::new(
//!     Arc::clone(&engine),
//!     coordination,
//!     Arc::new(DefaultObjectStoreFactory),
//!     config,
//! ));
//! let driver = coordinator.spawn(shutdown_rx);
//!
//! let fragments = engine.get("user-42", &[]).await;
//! ```

pub mod cache;
pub mod gc;
pub mod loader;
pub mod observability;
pub mod refresh;
pub mod table;
pub mod view;

pub use loader::ShardLoader;
pub use refresh::{CycleOutcome, EngineConfig, RefreshCoordinator, ServiceRegistrar};
pub use table::{key_hash, shard_index, RowSource, Table, TableOptions};
pub use view::{Engine, Fragment, View, ViewUpdate};
