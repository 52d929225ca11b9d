use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument};

use crate::orchestrator::{InitializeArgs, OrchestratorCommand};
use crate::server::AppState;

use super::{dispatch, ApiError};

/// Request body for `POST /v1/databases`.
#[derive(Debug, Deserialize)]
pub struct CreateDatabaseRequest {
    pub name: String,
    #[serde(flatten)]
    pub args: InitializeArgs,
}

#[instrument(skip(state, headers, req), fields(database = %req.name, dimensions = req.args.dimensions))]
pub async fn create_database(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateDatabaseRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let configuration = dispatch(
        &state,
        req.name,
        &headers,
        OrchestratorCommand::Initialize(req.args),
    )
    .await?;
    info!("database created");
    Ok((StatusCode::CREATED, Json(configuration)))
}

/// Returns the database configuration with token values removed.
#[instrument(skip(state, headers), fields(database = %db))]
pub async fn get_database(
    State(state): State<AppState>,
    Path(db): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let configuration = dispatch(&state, db, &headers, OrchestratorCommand::GetConfiguration).await?;
    Ok(Json(configuration))
}

#[instrument(skip(state, headers), fields(database = %db))]
pub async fn delete_database(
    State(state): State<AppState>,
    Path(db): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    dispatch(&state, db, &headers, OrchestratorCommand::Destroy).await?;
    info!("database deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, headers), fields(database = %db))]
pub async fn flush_database(
    State(state): State<AppState>,
    Path(db): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let outcome = dispatch(&state, db, &headers, OrchestratorCommand::Flush).await?;
    Ok(Json(outcome))
}
