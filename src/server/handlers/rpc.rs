use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use tracing::instrument;

use crate::orchestrator::OrchestratorRequest;
use crate::server::AppState;

use super::ApiError;

/// `POST /v1/rpc`: run one orchestrator command.
///
/// Answers `{"result": ...}` on success; errors carry their own status.
#[instrument(skip(state, request), fields(database = %request.database_name, method = request.command.method()))]
pub async fn rpc(
    State(state): State<AppState>,
    Json(request): Json<OrchestratorRequest>,
) -> Result<Json<Value>, ApiError> {
    let result = state.orchestrator.dispatch(request).await?;
    Ok(Json(json!({ "result": result })))
}
