use std::sync::Arc;

use tokio::net::TcpListener;

use super::harness::TestHarness;

use cirrus::config::Config;
use cirrus::orchestrator::Orchestrator;
use cirrus::server::routes::build_router;
use cirrus::server::AppState;

/// Start a server on an ephemeral port after adjusting the harness config.
/// Returns (base_url, harness, orchestrator).
pub async fn start_test_server_with_config(
    configure: impl FnOnce(&mut Config),
) -> (String, TestHarness, Arc<Orchestrator>) {
    let harness = TestHarness::new();
    let mut config = harness.config();
    configure(&mut config);
    let config = Arc::new(config);
    let orchestrator = Arc::new(Orchestrator::new(config.clone(), harness.store.clone()));

    let state = AppState {
        store: harness.store.clone(),
        orchestrator: orchestrator.clone(),
        config,
    };
    let app = build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://{addr}");

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (base_url, harness, orchestrator)
}

pub async fn start_test_server() -> (String, TestHarness) {
    let (url, harness, _orchestrator) = start_test_server_with_config(|_| {}).await;
    (url, harness)
}

/// POST one orchestrator RPC call and return (status, body).
pub async fn rpc(
    client: &reqwest::Client,
    base_url: &str,
    body: serde_json::Value,
) -> (u16, serde_json::Value) {
    let resp = client
        .post(format!("{base_url}/v1/rpc"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}
