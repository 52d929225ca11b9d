use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use tracing::instrument;

use crate::orchestrator::OrchestratorCommand;
use crate::server::AppState;
use crate::types::KnnQuery;

use super::{dispatch, ApiError};

/// k-NN search. Answers `{"results": [...]}`.
#[instrument(skip(state, headers, query), fields(database = %db, k = query.k))]
pub async fn query_database(
    State(state): State<AppState>,
    Path(db): Path<String>,
    headers: HeaderMap,
    Json(query): Json<KnnQuery>,
) -> Result<Json<Value>, ApiError> {
    let results = dispatch(&state, db, &headers, OrchestratorCommand::Query(query)).await?;
    Ok(Json(json!({ "results": results })))
}

#[instrument(skip(state, headers), fields(database = %db))]
pub async fn count_database(
    State(state): State<AppState>,
    Path(db): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let count = dispatch(&state, db, &headers, OrchestratorCommand::Count).await?;
    Ok(Json(count))
}
