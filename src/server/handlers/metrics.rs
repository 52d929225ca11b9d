use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use prometheus::{Encoder, TextEncoder};

/// Prometheus text exposition of the default registry.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buf) {
        tracing::error!(error = %e, "failed to encode prometheus metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string())],
            format!("metrics encoding failed: {e}").into_bytes(),
        );
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buf,
    )
}
