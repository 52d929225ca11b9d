use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::server::AppState;

/// Liveness probe.
pub async fn health_check() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Readiness probe: 200 once the object store answers a listing.
pub async fn readiness_check(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.store.list_prefix("__healthcheck__").await {
        Ok(_) => Ok(Json(json!({
            "status": "ready",
            "store_connected": true,
            "backend": state.config.storage.backend,
        }))),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready", "store_connected": false, "error": e.to_string()})),
        )),
    }
}
