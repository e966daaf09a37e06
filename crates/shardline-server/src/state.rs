//! Application state shared across all HTTP handlers
//!
//! Handlers get the state through axum's `State` extractor. It is cheap to
//! clone: one `Arc` around the engine handle and the start time.

use std::sync::Arc;
use std::time::Instant;

use shardline_engine::Engine;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    engine: Arc<Engine>,
    start_time: Instant,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                engine,
                start_time: Instant::now(),
            }),
        }
    }

    /// The serving engine; its view is swapped by the refresh driver
    pub fn engine(&self) -> &Arc<Engine> {
        &self.inner.engine
    }

    /// Server uptime in seconds
    pub fn uptime(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(Arc::new(Engine::default()))
    }
}
