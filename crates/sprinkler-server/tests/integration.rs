use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use http_body_util::BodyExt;
use serde_json::json;
use sprinkler_core::clock::RuntimeClock;
use sprinkler_core::config::Config;
use sprinkler_core::event_log::RunStore;
use sprinkler_core::hardware::MockLineDriver;
use sprinkler_core::store::MemoryStore;
use sprinkler_core::SprinklerSystem;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const CONFIG: &str = r#"
environment: development
actuators:
  - { id: 1, name: Lawn, line: 17, rateLitersPerSecond: 0.5, autoShutOffSeconds: 600 }
  - { id: 2, name: Roses, line: 22, rateLitersPerSecond: 0.25 }
scenarios:
  - id: 10
    name: Morning
    timeline:
      - { actuator: 1, durationSeconds: 5 }
      - { actuator: 2, durationSeconds: 3 }
"#;

struct TestApp {
    router: axum::Router,
    driver: Arc<MockLineDriver>,
}

async fn app() -> TestApp {
    let config = Config::from_yaml_str(CONFIG).unwrap();
    let driver = Arc::new(MockLineDriver::new());
    let system = SprinklerSystem::boot(
        &config,
        driver.clone(),
        Arc::new(MemoryStore::new()),
        RunStore::in_memory().unwrap(),
        Arc::new(RuntimeClock::new()),
    )
    .await
    .unwrap();
    TestApp {
        router: sprinkler_server::build_router(Arc::new(system)),
        driver,
    }
}

/// Send a GET request via `oneshot` and return (status, parsed JSON body).
async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Send a POST request with a raw body via `oneshot` and return (status, parsed JSON body).
async fn post_raw(app: axum::Router, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn post_json(
    app: axum::Router,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    post_raw(app, uri, &body.to_string()).await
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

#[tokio::test]
async fn index_lists_routes() {
    let t = app().await;
    let (status, body) = get(t.router, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["links"]["sprinklers"], "/sprinklers");
}

// ---------------------------------------------------------------------------
// Sprinklers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_sprinklers_returns_configured_order() {
    let t = app().await;
    let (status, body) = get(t.router, "/sprinklers").await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<u64> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(body[0]["uri"], "/sprinklers/1");
    assert_eq!(body[0]["isActive"], false);
    assert_eq!(body[0]["lineActive"], false);
}

#[tokio::test]
async fn get_unknown_sprinkler_is_404() {
    let t = app().await;
    let (status, body) = get(t.router, "/sprinklers/99").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("99"));
}

#[tokio::test]
async fn non_numeric_ids_are_json_404() {
    let t = app().await;
    let (status, body) = get(t.router.clone(), "/sprinklers/lawn").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("/sprinklers/lawn"));

    let (status, body) = post_json(t.router, "/scenarios/morning", json!({"state": "start"})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn activate_and_deactivate_sprinkler() {
    let t = app().await;
    let (status, body) = post_json(t.router.clone(), "/sprinklers/1", json!({"isActive": true})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isActive"], true);
    assert!(body["startedAt"].is_string());
    assert!(body["autoEndsAt"].is_string());

    let (_, body) = get(t.router.clone(), "/sprinklers/1").await;
    assert_eq!(body["lineActive"], true);

    let (status, body) = post_json(t.router, "/sprinklers/1", json!({"isActive": false})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isActive"], false);
    assert!(body["startedAt"].is_null());
}

#[tokio::test]
async fn repeated_activation_does_not_touch_hardware() {
    let t = app().await;
    post_json(t.router.clone(), "/sprinklers/1", json!({"isActive": true})).await;
    let writes = t.driver.writes_to(17);
    let (status, _) = post_json(t.router, "/sprinklers/1", json!({"isActive": true})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(t.driver.writes_to(17), writes);
}

#[tokio::test]
async fn unrecognised_payload_is_400() {
    let t = app().await;
    let (status, body) = post_json(t.router.clone(), "/sprinklers/1", json!({"colour": "red"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "No processable payload in request body");

    let (status, _) = post_raw(t.router, "/sprinklers/1", "not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn rename_sprinkler() {
    let t = app().await;
    let (status, body) = post_json(t.router, "/sprinklers/2", json!({"name": "Rose bed"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Rose bed");
    assert_eq!(body["isActive"], false);
}

#[tokio::test]
async fn hardware_failure_is_502() {
    let t = app().await;
    t.driver.fail_line(22);
    let (status, _) = post_json(t.router.clone(), "/sprinklers/2", json!({"isActive": true})).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let (_, body) = get(t.router, "/sprinklers/2").await;
    assert_eq!(body["isActive"], false);
}

#[tokio::test]
async fn creating_sprinklers_is_rejected() {
    let t = app().await;
    let (status, _) = post_json(t.router, "/sprinklers", json!({"name": "New"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_payload_errors() {
    let t = app().await;
    let (status, body) = post_json(t.router.clone(), "/scenarios/10", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Missing state property");

    let (status, _) = post_json(t.router.clone(), "/scenarios/10", json!({"state": "stop"})).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = post_json(t.router, "/scenarios/11", json!({"state": "start"})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn scenario_runs_to_completion() {
    let t = app().await;
    let (status, body) = post_json(t.router.clone(), "/scenarios/10", json!({"state": "start"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "running");

    tokio::time::sleep(Duration::from_millis(500)).await;
    let (_, body) = get(t.router.clone(), "/scenarios/10").await;
    assert_eq!(body["currentActuator"], 1);

    tokio::time::sleep(Duration::from_secs(9)).await;
    let (_, body) = get(t.router.clone(), "/scenarios/10").await;
    assert_eq!(body["state"], "stopped");
    assert_eq!(body["runHistory"].as_array().unwrap().len(), 1);

    let (status, body) = get(t.router, "/events?sprinkler=2").await;
    assert_eq!(status, StatusCode::OK);
    let runs = body.as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert!((runs[0]["volumeLiters"].as_f64().unwrap() - 0.75).abs() < 0.01);
}

#[tokio::test(start_paused = true)]
async fn stopping_scenario_turns_sprinkler_off() {
    let t = app().await;
    post_json(t.router.clone(), "/scenarios/10", json!({"state": "start"})).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let (status, body) = post_json(t.router.clone(), "/scenarios/10", json!({"state": "stop"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "stopped");
    let (_, body) = get(t.router, "/sprinklers/1").await;
    assert_eq!(body["isActive"], false);
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn events_require_sprinkler_parameter() {
    let t = app().await;
    let (status, body) = get(t.router.clone(), "/events").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Missing sprinkler parameter");

    let (status, _) = get(t.router, "/events?sprinkler=1&from=0&to=1").await;
    assert_eq!(status, StatusCode::OK);
}
