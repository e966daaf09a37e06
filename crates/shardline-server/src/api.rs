//! HTTP API handlers
//!
//! The read contract over HTTP: one key, optionally restricted to some
//! tables, answered from whatever view is live when the request arrives.

use std::collections::BTreeMap;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use shardline_core::{FeatureValue, JsonMergeOperator, MapMergeOperator};
use shardline_engine::Fragment;

use crate::{
    error::{AppError, Result},
    state::AppState,
};

/// Shape of a lookup response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupFormat {
    /// One flat JSON object with every table's columns
    #[default]
    Merged,
    /// One flat object keyed `table/column`
    Qualified,
    /// One entry per table, with its version
    Fragments,
}

#[derive(Debug, Deserialize)]
pub struct LookupRequest {
    pub key: String,

    /// Tables to ask; empty means every live table
    #[serde(default)]
    pub tables: Vec<String>,

    #[serde(default)]
    pub format: LookupFormat,
}

#[derive(Debug, Serialize)]
pub struct QualifiedResponse {
    pub key: String,
    pub features: BTreeMap<String, FeatureValue>,
}

#[derive(Debug, Serialize)]
pub struct FragmentsResponse {
    pub key: String,
    pub fragments: Vec<Fragment>,
}

/// Features for one key
///
/// ## Endpoint
/// `POST /v1/features`
///
/// ## Request Body
/// ```json
/// { "key": "user-42", "tables": ["profile"], "format": "merged" }
/// ```
///
/// ## Response
/// ```json
/// { "key": "user-42", "features": { "age": 31, "city": "berlin" } }
/// ```
///
/// With `"format": "fragments"` the per-table values come back separately:
/// ```json
/// { "key": "user-42", "fragments": [
///     { "table": "profile", "version": "v7", "values": { "age": 31 } } ] }
/// ```
///
/// ## HTTP Status
/// - 200 OK: at least one table had the key
/// - 400 Bad Request: empty key
/// - 404 Not Found: no requested table had the key
pub async fn get_features(
    State(state): State<AppState>,
    Json(request): Json<LookupRequest>,
) -> Result<Response> {
    if request.key.is_empty() {
        return Err(AppError::BadRequest("key must not be empty".to_string()));
    }
    tracing::debug!(
        key = %request.key,
        tables = request.tables.len(),
        format = ?request.format,
        "Handling feature lookup"
    );

    let engine = state.engine();
    let not_found = || AppError::NotFound(format!("key '{}'", request.key));

    match request.format {
        LookupFormat::Merged => {
            let merged = engine
                .get_merged(&request.key, &request.tables, &JsonMergeOperator)
                .await?
                .ok_or_else(not_found)?;
            Ok(merged_body(&request.key, &merged)?)
        }
        LookupFormat::Qualified => {
            let features = engine
                .get_merged(&request.key, &request.tables, &MapMergeOperator)
                .await?
                .ok_or_else(not_found)?;
            Ok(Json(QualifiedResponse {
                key: request.key.clone(),
                features,
            })
            .into_response())
        }
        LookupFormat::Fragments => {
            let fragments = engine.get(&request.key, &request.tables).await;
            if fragments.is_empty() {
                return Err(not_found());
            }
            Ok(Json(FragmentsResponse {
                key: request.key.clone(),
                fragments,
            })
            .into_response())
        }
    }
}

/// Writes the merged object body without re-parsing it
fn merged_body(key: &str, merged: &[u8]) -> Result<Response> {
    let key = serde_json::to_vec(key).map_err(|e| AppError::Internal(e.to_string()))?;
    let features = JsonMergeOperator::wrap(merged);

    let mut body = Vec::with_capacity(key.len() + features.len() + 20);
    body.extend_from_slice(br#"{"key":"#);
    body.extend_from_slice(&key);
    body.extend_from_slice(br#","features":"#);
    body.extend_from_slice(&features);
    body.push(b'}');

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response())
}

#[derive(Debug, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub version: String,
    pub shards: usize,
    pub columns: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct TablesResponse {
    pub tables: Vec<TableInfo>,
    pub count: usize,
}

/// Tables in the live view
///
/// ## Endpoint
/// `GET /v1/tables`
pub async fn list_tables(State(state): State<AppState>) -> Json<TablesResponse> {
    let view = state.engine().view();
    let tables: Vec<TableInfo> = view
        .tables()
        .map(|t| TableInfo {
            name: t.name().to_string(),
            version: t.version().to_string(),
            shards: t.shard_count(),
            columns: t.columns().iter().map(|c| c.name.clone()).collect(),
        })
        .collect();
    Json(TablesResponse {
        count: tables.len(),
        tables,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_request_defaults() {
        let request: LookupRequest = serde_json::from_str(r#"{"key":"u1"}"#).unwrap();
        assert!(request.tables.is_empty());
        assert_eq!(request.format, LookupFormat::Merged);

        let request: LookupRequest =
            serde_json::from_str(r#"{"key":"u1","format":"fragments"}"#).unwrap();
        assert_eq!(request.format, LookupFormat::Fragments);
    }

    #[tokio::test]
    async fn test_merged_body_is_valid_json() {
        let response = merged_body("a\"b", br#""x":1,"y":"z""#).unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["key"], "a\"b");
        assert_eq!(value["features"]["x"], 1);
        assert_eq!(value["features"]["y"], "z");
    }
}
