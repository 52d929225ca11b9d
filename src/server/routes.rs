use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers::{databases, health, metrics, query, rpc, vectors};
use super::middleware;
use super::AppState;

/// Builds the axum router with all routes, middleware, and shared state.
pub fn build_router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.server.request_timeout_secs);
    let body_limit = state.config.server.max_request_body_mb * 1024 * 1024;

    Router::new()
        .route("/healthz", get(health::health_check))
        .route("/readyz", get(health::readiness_check))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/v1/rpc", post(rpc::rpc))
        .route("/v1/databases", post(databases::create_database))
        .route(
            "/v1/databases/:db",
            get(databases::get_database).delete(databases::delete_database),
        )
        .route(
            "/v1/databases/:db/vectors",
            post(vectors::add_vectors).delete(vectors::remove_vectors),
        )
        .route("/v1/databases/:db/query", post(query::query_database))
        .route("/v1/databases/:db/count", get(query::count_database))
        .route("/v1/databases/:db/flush", post(databases::flush_database))
        .layer(axum::middleware::from_fn(middleware::http_metrics))
        .layer(TimeoutLayer::new(timeout))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(axum::middleware::from_fn(middleware::request_id))
        .with_state(state)
}
