mod common;

use serde_json::json;

use common::server::{rpc, start_test_server, start_test_server_with_config};

#[tokio::test]
async fn test_health_check() {
    let (base_url, _harness) = start_test_server().await;

    let resp = reqwest::get(format!("{base_url}/healthz")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_readiness_check() {
    let (base_url, _harness) = start_test_server().await;

    let resp = reqwest::get(format!("{base_url}/readyz")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let (base_url, _harness) = start_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{base_url}/healthz"))
        .header("x-request-id", "abc-123")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-request-id"], "abc-123");

    let resp = client.get(format!("{base_url}/healthz")).send().await.unwrap();
    assert!(resp.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn test_rpc_lifecycle() {
    let (base_url, harness) = start_test_server().await;
    let client = reqwest::Client::new();
    let db = harness.db("rpc");

    let (status, body) = rpc(
        &client,
        &base_url,
        json!({"databaseName": db, "method": "initialize", "args": {"dimensions": 3, "partitions": 2}}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["dimensions"], 3);

    let (status, body) = rpc(
        &client,
        &base_url,
        json!({"databaseName": db, "method": "addVectors", "args": {"vectors": [
            {"label": "t", "vector": [1.0, 2.0, 3.0]},
            {"label": "u", "vector": [3.0, 2.0, 1.0]}
        ]}}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["count"], 2);

    let (status, body) = rpc(
        &client,
        &base_url,
        json!({"databaseName": db, "method": "query", "args": {"vector": [1.0, 2.0, 3.0], "k": 1}}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["result"][0]["label"], "t");
    assert_eq!(body["result"][0]["distance"], 0.0);

    let (status, body) = rpc(&client, &base_url, json!({"databaseName": db, "method": "count"})).await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["count"], 2);

    let (status, body) = rpc(&client, &base_url, json!({"databaseName": db, "method": "flush"})).await;
    assert_eq!(status, 200);
    assert!(body["result"]["lastFlush"].as_u64().unwrap() > 0);

    let (status, _) = rpc(&client, &base_url, json!({"databaseName": db, "method": "destroy"})).await;
    assert_eq!(status, 200);

    let (status, body) = rpc(&client, &base_url, json!({"databaseName": db, "method": "count"})).await;
    assert_eq!(status, 404);
    assert_eq!(body["status"], 404);
}

#[tokio::test]
async fn test_rpc_errors_carry_status() {
    let (base_url, harness) = start_test_server().await;
    let client = reqwest::Client::new();
    let db = harness.db("errors");

    rpc(
        &client,
        &base_url,
        json!({"databaseName": db, "method": "initialize", "args": {"dimensions": 2}}),
    )
    .await;

    let (status, body) = rpc(
        &client,
        &base_url,
        json!({"databaseName": db, "method": "query", "args": {"vector": [0.0, 0.0], "k": -1}}),
    )
    .await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("k must be"));

    let (status, _) = rpc(
        &client,
        &base_url,
        json!({"databaseName": db, "method": "query", "args": {"vector": [0.0], "k": 1}}),
    )
    .await;
    assert_eq!(status, 400);

    // Unknown methods never reach the orchestrator.
    let resp = client
        .post(format!("{base_url}/v1/rpc"))
        .json(&json!({"databaseName": db, "method": "explode"}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_client_error());
}

#[tokio::test]
async fn test_rest_routes_with_token_header() {
    let (base_url, harness) = start_test_server().await;
    let client = reqwest::Client::new();
    let db = harness.db("rest");

    let resp = client
        .post(format!("{base_url}/v1/databases"))
        .json(&json!({"name": db, "dimensions": 2}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let (status, body) = rpc(
        &client,
        &base_url,
        json!({"databaseName": db, "method": "addToken", "args": {"name": "ci"}}),
    )
    .await;
    assert_eq!(status, 200);
    let token = body["result"]["value"].as_str().unwrap().to_string();

    let resp = client
        .post(format!("{base_url}/v1/databases/{db}/vectors"))
        .json(&json!({"vectors": [{"label": "a", "vector": [0.0, 1.0]}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .post(format!("{base_url}/v1/databases/{db}/vectors"))
        .header("x-secret-token", &token)
        .json(&json!({"vectors": [{"label": "a", "vector": [0.0, 1.0]}, {"label": "b", "vector": [1.0, 1.0]}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .post(format!("{base_url}/v1/databases/{db}/query"))
        .header("x-secret-token", &token)
        .json(&json!({"vector": [0.0, 1.0], "k": 5}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["results"].as_array().unwrap().len(), 2);
    assert_eq!(body["results"][0]["label"], "a");

    let resp = client
        .delete(format!("{base_url}/v1/databases/{db}/vectors"))
        .header("x-secret-token", &token)
        .json(&json!({"labels": ["a"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(format!("{base_url}/v1/databases/{db}/count"))
        .header("x-secret-token", &token)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["count"], 1);

    let resp = client
        .get(format!("{base_url}/v1/databases/{db}"))
        .header("x-secret-token", &token)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["secretTokens"][0]["value"], "");

    let resp = client
        .delete(format!("{base_url}/v1/databases/{db}"))
        .header("x-secret-token", &token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
}

#[tokio::test]
async fn test_batch_size_limit() {
    let (base_url, harness, _orchestrator) =
        start_test_server_with_config(|config| config.server.max_batch_size = 2).await;
    let client = reqwest::Client::new();
    let db = harness.db("batch");

    rpc(
        &client,
        &base_url,
        json!({"databaseName": db, "method": "initialize", "args": {"dimensions": 1}}),
    )
    .await;
    let (status, _) = rpc(
        &client,
        &base_url,
        json!({"databaseName": db, "method": "addVectors", "args": {"vectors": [
            {"label": "a", "vector": [1.0]},
            {"label": "b", "vector": [2.0]},
            {"label": "c", "vector": [3.0]}
        ]}}),
    )
    .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (base_url, _harness) = start_test_server().await;
    reqwest::get(format!("{base_url}/healthz")).await.unwrap();

    let resp = reqwest::get(format!("{base_url}/metrics")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert!(body.contains("cirrus_http_requests_total"));
}
