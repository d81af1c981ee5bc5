use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::StatusCode,
};
use std::sync::Arc;

use super::cache::Router;
use super::protocol::{
    GetResponse, RouterStats, ScanEntryDto, ScanQuery, ScanResponse, TopologyPushResponse,
    WriteResponse,
};
use crate::error::RouterError;
use crate::topology::protocol::TopologyUpdate;

type JsonCache = super::cache::RemoteCache<String, serde_json::Value>;

fn status_of(error: &RouterError) -> StatusCode {
    match error {
        RouterError::Application { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        RouterError::Timeout { .. } | RouterError::TopologyWaitTimeout { .. } => {
            StatusCode::GATEWAY_TIMEOUT
        }
        RouterError::Unreachable { .. }
        | RouterError::RetriesExhausted { .. }
        | RouterError::NoOwnersAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RouterError::ScanAborted { .. } => StatusCode::BAD_GATEWAY,
        RouterError::InvalidTopology(_)
        | RouterError::InvalidConfig(_)
        | RouterError::Serialization(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Topology announcement from the membership collaborator.
pub async fn handle_topology_push(
    Extension(router): Extension<Arc<Router>>,
    Path(cache): Path<String>,
    Json(update): Json<TopologyUpdate>,
) -> (StatusCode, Json<TopologyPushResponse>) {
    let version = update.version;
    match router.on_topology_push(&cache, update) {
        Ok(accepted) => (
            StatusCode::OK,
            Json(TopologyPushResponse {
                accepted,
                version: router.registry().version(&cache),
                error: None,
            }),
        ),
        Err(e) => {
            tracing::error!(cache = %cache, version, "Rejected topology push: {}", e);
            (
                status_of(&e),
                Json(TopologyPushResponse {
                    accepted: false,
                    version: router.registry().version(&cache),
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

pub async fn handle_get(
    Extension(router): Extension<Arc<Router>>,
    Path((cache, key)): Path<(String, String)>,
) -> (StatusCode, Json<GetResponse>) {
    let map: JsonCache = router.cache(&cache);
    match map.get(&key).await {
        Ok(Some(value)) => (
            StatusCode::OK,
            Json(GetResponse {
                value: Some(value),
                error: None,
            }),
        ),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(GetResponse {
                value: None,
                error: None,
            }),
        ),
        Err(e) => {
            tracing::error!(cache = %cache, key = %key, "Failed to get: {}", e);
            (
                status_of(&e),
                Json(GetResponse {
                    value: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

pub async fn handle_put(
    Extension(router): Extension<Arc<Router>>,
    Path((cache, key)): Path<(String, String)>,
    Json(value): Json<serde_json::Value>,
) -> (StatusCode, Json<WriteResponse>) {
    let map: JsonCache = router.cache(&cache);
    write_response(&cache, &key, map.put(key.clone(), &value).await)
}

pub async fn handle_remove(
    Extension(router): Extension<Arc<Router>>,
    Path((cache, key)): Path<(String, String)>,
) -> (StatusCode, Json<WriteResponse>) {
    let map: JsonCache = router.cache(&cache);
    write_response(&cache, &key, map.remove(&key).await)
}

fn write_response(
    cache: &str,
    key: &str,
    result: crate::error::Result<Option<serde_json::Value>>,
) -> (StatusCode, Json<WriteResponse>) {
    match result {
        Ok(previous) => (
            StatusCode::OK,
            Json(WriteResponse {
                success: true,
                previous,
                error: None,
            }),
        ),
        Err(e) => {
            tracing::error!(cache, key, "Write failed: {}", e);
            (
                status_of(&e),
                Json(WriteResponse {
                    success: false,
                    previous: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

/// Full scan of a cache, returned as one JSON document.
///
/// An aborted scan still returns what it delivered, with the partitions it missed.
pub async fn handle_scan(
    Extension(router): Extension<Arc<Router>>,
    Path(cache): Path<String>,
    Query(query): Query<ScanQuery>,
) -> (StatusCode, Json<ScanResponse>) {
    let options = match query.into_options() {
        Ok(options) => options,
        Err(e) => {
            tracing::error!(cache = %cache, "Bad scan query: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(ScanResponse {
                    complete: false,
                    entries: Vec::new(),
                    missed_partitions: Default::default(),
                    error: Some(e),
                }),
            );
        }
    };

    let mut stream = router.scan(&cache, options);
    let mut entries = Vec::new();
    while let Some(item) = stream.next().await {
        let entry = match item {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(cache = %cache, delivered = entries.len(), "Scan failed: {}", e);
                let missed = match &e {
                    RouterError::ScanAborted { missed } => missed.clone(),
                    _ => Default::default(),
                };
                return (
                    status_of(&e),
                    Json(ScanResponse {
                        complete: false,
                        entries,
                        missed_partitions: missed,
                        error: Some(e.to_string()),
                    }),
                );
            }
        };
        let value = serde_json::from_str(&entry.value_json)
            .unwrap_or(serde_json::Value::String(entry.value_json));
        entries.push(ScanEntryDto {
            key: entry.key,
            value,
            partition: entry.partition,
        });
    }

    (
        StatusCode::OK,
        Json(ScanResponse {
            complete: true,
            entries,
            missed_partitions: Default::default(),
            error: None,
        }),
    )
}

pub async fn handle_stats(Extension(router): Extension<Arc<Router>>) -> Json<RouterStats> {
    Json(router.stats())
}
