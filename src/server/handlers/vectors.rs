use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::Value;
use tracing::{info, instrument};

use crate::orchestrator::commands::{AddVectorsArgs, RemoveVectorsArgs};
use crate::orchestrator::OrchestratorCommand;
use crate::server::AppState;

use super::{dispatch, ApiError};

#[instrument(skip(state, headers, req), fields(database = %db, vector_count = req.vectors.len()))]
pub async fn add_vectors(
    State(state): State<AppState>,
    Path(db): Path<String>,
    headers: HeaderMap,
    Json(req): Json<AddVectorsArgs>,
) -> Result<Json<Value>, ApiError> {
    let count = req.vectors.len();
    let outcome = dispatch(&state, db, &headers, OrchestratorCommand::AddVectors(req)).await?;
    info!(added = count, "vectors added");
    Ok(Json(outcome))
}

#[instrument(skip(state, headers, req), fields(database = %db, remove_count = req.labels.len()))]
pub async fn remove_vectors(
    State(state): State<AppState>,
    Path(db): Path<String>,
    headers: HeaderMap,
    Json(req): Json<RemoveVectorsArgs>,
) -> Result<Json<Value>, ApiError> {
    let count = req.labels.len();
    let outcome = dispatch(&state, db, &headers, OrchestratorCommand::RemoveVectors(req)).await?;
    info!(removed = count, "vectors removed");
    Ok(Json(outcome))
}
