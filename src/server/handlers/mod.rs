/// Database lifecycle handlers.
pub mod databases;
/// Health and readiness probe handlers.
pub mod health;
/// Prometheus metrics exposition handler.
pub mod metrics;
/// Query and count handlers.
pub mod query;
/// Orchestrator RPC endpoint.
pub mod rpc;
/// Vector add and remove handlers.
pub mod vectors;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};

use crate::error::CirrusError;
use crate::orchestrator::{OrchestratorCommand, OrchestratorRequest};
use crate::server::AppState;

/// Header carrying a database secret token on the REST routes.
pub const SECRET_TOKEN_HEADER: &str = "x-secret-token";

/// Wrapper that converts `CirrusError` into an HTTP response.
pub struct ApiError(pub CirrusError);

impl From<CirrusError> for ApiError {
    fn from(e: CirrusError) -> Self {
        ApiError(e)
    }
}

/// Maps `ApiError` to an HTTP response with a JSON body and appropriate status code.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status_code.is_server_error() {
            tracing::error!(error = %self.0, status, "server error");
        } else if status_code.is_client_error() {
            tracing::warn!(error = %self.0, status, "client error");
        }
        let body = json!({
            "error": self.0.to_string(),
            "status": status,
        });
        (status_code, axum::Json(body)).into_response()
    }
}

fn secret_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SECRET_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// Route a REST call through the orchestrator so token checks match RPC.
async fn dispatch(
    state: &AppState,
    database: String,
    headers: &HeaderMap,
    command: OrchestratorCommand,
) -> Result<Value, ApiError> {
    let request = OrchestratorRequest {
        database_name: database,
        secret_token: secret_token(headers),
        command,
    };
    Ok(state.orchestrator.dispatch(request).await?)
}
