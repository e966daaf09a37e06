//! Shardline Server Library
//!
//! Assembles an engine, its refresh coordinator and the HTTP router from a
//! [`config::Config`]. The binary in `main.rs` adds logging, layers and
//! signal handling; tests drive [`build_router`] directly.
//!
//! ```rust,ignore
//! let config = shardline_server::config::load("shardline.yaml")?;
//! let server = shardline_server::bootstrap(&config)?;
//! let driver = server.coordinator.clone().spawn(shutdown.subscribe());
//! let app = shardline_server::build_router(server.state.clone());
//! ```

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use shardline_core::coordination::{CoordinationStore, MemoryCoordinationStore};
use shardline_core::storage::DefaultObjectStoreFactory;
use shardline_engine::RefreshCoordinator;

pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod health;
pub mod request_id;
pub mod shutdown;
pub mod state;

use crate::catalog::CatalogFileStore;
use crate::state::AppState;

/// Everything the binary needs to run one serving replica
pub struct Server {
    pub state: AppState,
    pub coordinator: Arc<RefreshCoordinator>,
    /// The in-process coordination store, fed from the catalog
    pub coordination: Arc<MemoryCoordinationStore>,
}

/// Builds the engine and its refresh coordinator from configuration
///
/// Nothing is loaded yet; the first refresh cycle runs once the driver is
/// spawned.
pub fn bootstrap(config: &config::Config) -> anyhow::Result<Server> {
    let engine_config = config.engine.engine_config();
    std::fs::create_dir_all(&engine_config.work_dir)?;

    let coordination = Arc::new(MemoryCoordinationStore::new());
    let store: Arc<dyn CoordinationStore> = match (&config.catalog_file, &config.catalog) {
        (Some(path), _) => {
            tracing::info!(path = %path.display(), "Watching catalog file");
            Arc::new(CatalogFileStore::new(
                path,
                engine_config.machine_id.clone(),
                coordination.clone(),
            ))
        }
        (None, Some(catalog)) => {
            catalog.seed(&coordination, &engine_config.machine_id)?;
            coordination.clone()
        }
        (None, None) => {
            tracing::warn!(
                machine_id = %engine_config.machine_id,
                "No catalog configured; serving nothing until this machine is bound"
            );
            coordination.clone()
        }
    };

    let engine = Arc::new(engine_config.build_engine());
    let coordinator = Arc::new(RefreshCoordinator::new(
        Arc::clone(&engine),
        store,
        Arc::new(DefaultObjectStoreFactory),
        engine_config,
    ));

    Ok(Server {
        state: AppState::new(engine),
        coordinator,
        coordination,
    })
}

/// All routes, with the request-ID layer
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/v1/features", post(api::get_features))
        .route("/v1/tables", get(api::list_tables))
        .with_state(state)
        .layer(axum::middleware::from_fn(request_id::request_id_middleware))
}
