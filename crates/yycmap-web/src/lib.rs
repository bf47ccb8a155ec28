//! Axum read API over the persisted artifacts.
//!
//! Three routes: the full light aggregate, per-id heavy details behind the
//! in-memory cache, and an operator-triggered refresh. Response shapes are
//! part of the interchange contract with the map UI.

use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use tokio::net::TcpListener;
use tracing::{error, info};
use yycmap_storage::{is_valid_artifact_id, ArtifactStore, DetailsCache};
use yycmap_sync::RefreshPipeline;

pub const CRATE_NAME: &str = "yycmap-web";

#[derive(Clone)]
pub struct AppState {
    store: ArtifactStore,
    /// Cache operations never yield, so a plain mutex is enough; the lock is
    /// released before any disk read.
    cache: Arc<Mutex<DetailsCache>>,
    pipeline: Arc<RefreshPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<RefreshPipeline>) -> Self {
        let config = pipeline.config();
        Self {
            store: ArtifactStore::new(config.data_dir.clone()),
            cache: Arc::new(Mutex::new(DetailsCache::with_limits(
                config.cache_capacity,
                config.cache_ttl(),
            ))),
            pipeline,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/properties/light", get(light_handler))
        .route("/api/properties/{id}/details", get(details_handler))
        .route("/api/update", post(update_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("YYCMAP_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve(pipeline: Arc<RefreshPipeline>, port: u16) -> anyhow::Result<()> {
    let state = AppState::new(pipeline);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving read api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Serves the light aggregate verbatim. "Not generated yet" is a distinct
/// condition from a read failure.
async fn light_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.read_light().await {
        Ok(Some(collection)) => {
            info!(count = collection.count, "serving light collection");
            Json(collection).into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "success": false,
                "error": "Light GeoJSON not found",
                "hint": "No refresh cycle has produced data yet. Trigger one via POST /api/update."
            })),
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to load light collection");
            server_error("Failed to load light GeoJSON")
        }
    }
}

async fn details_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    // Reject malformed ids before any cache or filesystem access.
    if !is_valid_artifact_id(&id) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "success": false,
                "error": "Invalid property ID format",
                "hint": "ID must contain only alphanumeric characters, underscores, and hyphens"
            })),
        )
            .into_response();
    }

    let cached = state.cache.lock().expect("cache lock").get(&id);
    if let Some(record) = cached {
        return details_ok(record);
    }

    match state.store.read_heavy(&id).await {
        Ok(Some(record)) => {
            state.cache.lock().expect("cache lock").set(&id, record.clone());
            details_ok(record)
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "success": false,
                "error": "Property not found",
                "propertyId": id,
                "hint": "No detailed data available for this property ID"
            })),
        )
            .into_response(),
        Err(err) => {
            error!(id, error = %err, "failed to load property details");
            server_error("Failed to load property details")
        }
    }
}

fn details_ok(record: yycmap_core::HeavyRecord) -> Response {
    info!(id = %record.id, "serving property details");
    Json(serde_json::json!({
        "success": true,
        "data": record,
        "timestamp": Utc::now()
    }))
    .into_response()
}

/// Runs one refresh cycle inline. Readers stay on the previous artifacts
/// until the new ones are swapped in, so triggering this mid-traffic is
/// safe.
async fn update_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_once().await {
        Ok(summary) => Json(serde_json::json!({
            "success": true,
            "updated": summary.valid,
            "timestamp": summary.finished_at
        }))
        .into_response(),
        Err(err) => {
            error!(error = format!("{err:#}"), "triggered refresh failed");
            server_error("Failed to update properties")
        }
    }
}

fn server_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "success": false, "error": message })),
    )
        .into_response()
}
