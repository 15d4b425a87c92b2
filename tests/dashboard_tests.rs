
use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use gridlet::dashboard::{router, DashboardState};
use gridlet::engine::EngineConnector;
use gridlet::node::ControlPlane;
use test_harness::{RunningGrid, TestGrid};

/// Create a test app backed by one running grid on platform "rpi"
fn create_test_app() -> (Router, RunningGrid) {
    let running = TestGrid::new().spawn(Vec::new());
    let mut grids = HashMap::new();
    grids.insert("rpi".to_string(), running.handle.clone());
    let control = ControlPlane::new(
        grids,
        running.connector.clone() as Arc<dyn EngineConnector>,
    );
    (router(DashboardState { control }), running)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn session_body(id: u64, name: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "type": "batch",
        "state": "SUBMITTED",
        "username": "alice",
        "max_jobs": 1,
        "dataset_split": 2,
        "command": ["python3", "train.py"],
        "platform": "rpi",
        "docker_image": { "name": "ubuntu-run" }
    })
}

#[tokio::test]
async fn test_platforms_endpoint_lists_grids() {
    let (app, running) = create_test_app();

    let (status, json) = send(&app, "GET", "/api/platforms", None).await;
    assert_eq!(status, StatusCode::OK);
    let platforms = json.as_array().unwrap();
    assert_eq!(platforms.len(), 1);
    assert_eq!(platforms[0]["platform"]["name"], "rpi");
    assert_eq!(platforms[0]["boards"].as_array().unwrap().len(), 0);

    running.stop().await;
}

#[tokio::test]
async fn test_board_lifecycle() {
    let (app, running) = create_test_app();

    let (status, json) = send(
        &app,
        "POST",
        "/api/platforms/rpi/boards",
        Some(json!({ "hostname": "rpi-01", "address": "10.0.0.1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);

    let (_, json) = send(&app, "GET", "/api/platforms", None).await;
    let boards = json[0]["boards"].as_array().unwrap();
    assert_eq!(boards.len(), 1);
    assert_eq!(boards[0]["hostname"], "rpi-01");
    assert_eq!(boards[0]["address"], "10.0.0.1");
    assert_eq!(boards[0]["used"], false);

    let (status, _) = send(&app, "DELETE", "/api/platforms/rpi/boards/rpi-01", None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, json) = send(&app, "GET", "/api/platforms", None).await;
    assert!(json[0]["boards"].as_array().unwrap().is_empty());

    running.stop().await;
}

#[tokio::test]
async fn test_unknown_platform_is_not_found() {
    let (app, running) = create_test_app();

    let (status, json) = send(
        &app,
        "POST",
        "/api/platforms/x86/boards",
        Some(json!({ "hostname": "pc-01" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["success"], false);
    assert!(json["error"].as_str().unwrap().contains("x86"));

    running.stop().await;
}

#[tokio::test]
async fn test_session_submit_save_and_cancel() {
    let (app, running) = create_test_app();

    let (status, json) = send(&app, "POST", "/api/sessions", Some(session_body(5, "train"))).await;
    assert_eq!(status, StatusCode::OK, "{}", json);

    let (_, json) = send(&app, "GET", "/api/platforms", None).await;
    let sessions = json[0]["subscribers"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["name"], "train");
    assert_eq!(sessions[0]["pending"], 2);

    // Nothing runs without boards, so there is no container to save.
    let (status, json) = send(
        &app,
        "POST",
        "/api/sessions/5/save",
        Some(json!({ "image_name": "train-snapshot" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["success"], false);

    let (status, _) = send(&app, "DELETE", "/api/sessions/5", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, "DELETE", "/api/sessions/5", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, json) = send(&app, "GET", "/api/platforms", None).await;
    assert!(json[0]["subscribers"].as_array().unwrap().is_empty());

    running.stop().await;
}

#[tokio::test]
async fn test_event_relay_and_diagnostics() {
    let (app, running) = create_test_app();

    let (status, _) = send(&app, "POST", "/api/events", Some(json!({ "event": "heartbeat" }))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        "POST",
        "/api/events",
        Some(json!({
            "event": "board_added",
            "platform": "rpi",
            "board": { "id": 3, "hostname": "rpi-02" }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = send(&app, "POST", "/api/diagnostics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json[0]["boards"][0]["hostname"], "rpi-02");

    running.stop().await;
}
