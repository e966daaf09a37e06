//! Health check endpoints
//!
//! - `/health` - liveness, succeeds whenever the process answers
//! - `/health/ready` - readiness, driven by the engine's status tracker

use std::collections::BTreeMap;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use shardline_core::TableStatus;

use crate::state::AppState;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
    /// Last coordination revision the engine adopted
    pub revision: i64,
    pub tables: BTreeMap<String, TableHealth>,
}

#[derive(Serialize)]
pub struct TableHealth {
    pub status: TableStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// `GET /health`
pub async fn liveness(State(state): State<AppState>) -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "ok".to_string(),
        uptime_seconds: state.uptime(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `GET /health/ready`
///
/// Ready when at least one table is serving and none is loading. Responds
/// 503 otherwise, so load balancers stop routing here during a reload.
///
/// ```json
/// {
///   "status": "ready",
///   "uptime_seconds": 123,
///   "version": "0.1.0",
///   "revision": 42,
///   "tables": { "profile": { "status": "serving", "version": "v7" } }
/// }
/// ```
pub async fn readiness(State(state): State<AppState>) -> Response {
    let engine = state.engine();
    let view = engine.view();
    let statuses = engine.status().snapshot();

    let tables: BTreeMap<String, TableHealth> = statuses
        .into_iter()
        .map(|(name, status)| {
            let version = view.get(&name).map(|t| t.version().to_string());
            (name, TableHealth { status, version })
        })
        .collect();

    let ready = engine.status().is_serving()
        && tables.values().any(|t| t.status == TableStatus::Serving);

    let response = ReadinessResponse {
        status: if ready { "ready" } else { "not_ready" }.to_string(),
        uptime_seconds: state.uptime(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        revision: engine.revision(),
        tables,
    };

    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_liveness_always_ok() {
        let Json(body) = liveness(State(AppState::default())).await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_readiness_follows_status_tracker() {
        let state = AppState::default();
        let status = state.engine().status();

        // nothing served yet
        let response = readiness(State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        status.set("profile", TableStatus::Serving);
        let response = readiness(State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);

        status.set("behavior", TableStatus::Loading);
        let response = readiness(State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        status.set("behavior", TableStatus::Serving);
        let response = readiness(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
