mod common;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{json, Value};

use common::{connect_ready, recv, start_server, test_app, test_state};

#[tokio::test]
async fn health_reports_counts() {
    let test = test_state();
    let server = TestServer::new(test_app(&test.state)).unwrap();

    for path in ["/health", "/wss/health"] {
        let resp = server.get(path).await;
        resp.assert_status_ok();
        let body = resp.json::<Value>();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["clients"], 0);
        assert_eq!(body["rooms"], 0);
        assert_eq!(body["busEnabled"], false);
        assert!(body["timestamp"].is_string());
    }
}

#[tokio::test]
async fn publish_rejects_malformed_json() {
    let test = test_state();
    let server = TestServer::new(test_app(&test.state)).unwrap();

    let resp = server.post("/wss-publish").text("{not json").await;
    resp.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(resp.json::<Value>()["error"]["code"], "INVALID_JSON");
}

#[tokio::test]
async fn publish_broadcasts_to_connected_clients() {
    let (addr, test) = start_server().await;
    let (mut ws, _) = connect_ready(addr, None).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/wss-publish"))
        .json(&json!({"type": "notification", "title": "hello"}))
        .send()
        .await
        .expect("publish request");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.expect("parse publish response");
    assert_eq!(body["success"], true);

    let msg = recv(&mut ws).await;
    assert_eq!(msg["title"], "hello");
    assert_eq!(test.hub().client_count(), 1);
}
