mod common;

use common::*;
use phone_hands::agent::Action;
use phone_hands::server;
use phone_hands::PhoneSession;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

async fn spawn_server(session: PhoneSession) -> SocketAddr {
    let app = server::router(session, "http://localhost:3000").expect("router");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

fn sse_payloads(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).expect("event json"))
        .collect()
}

#[tokio::test]
async fn init_then_stream_a_task_over_sse() {
    let model = ScriptedModel::new(vec![Scripted::Decide(decision(
        "tap the settings icon",
        Action::OpenApp { name: "Settings".into() },
        true,
    ))]);
    let session = session_with(model, FakeDevice::new());
    let addr = spawn_server(session.clone()).await;
    let http = reqwest::Client::new();
    let base = format!("http://{addr}");

    let status: Value = http.get(format!("{base}/api/status")).send().await.unwrap().json().await.unwrap();
    assert_eq!(status["status"], "uninitialized");
    assert_eq!(status["initialized"], false);

    let init: Value = http
        .post(format!("{base}/api/init"))
        .json(&json!({"base_url": "http://localhost:8080/v1", "model_name": "autoglm-phone-9b"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(init, json!({"success": true, "message": "Agent initialized"}));

    let body = http
        .post(format!("{base}/api/chat/stream"))
        .json(&json!({"message": "open settings app"}))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let events = sse_payloads(&body);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["type"], "step");
    assert_eq!(events[0]["step"], 1);
    assert_eq!(events[0]["action"], json!({"type": "open_app", "name": "Settings"}));
    assert_eq!(events[0]["success"], true);
    assert_eq!(events[0]["finished"], true);
    assert_eq!(events[1], json!({"type": "done", "message": "Task completed", "steps": 1, "success": true}));

    let history: Value = http.get(format!("{base}/api/history")).send().await.unwrap().json().await.unwrap();
    assert_eq!(history.as_array().unwrap().len(), 2);
    assert_eq!(history[1]["role"], "agent");
    assert_eq!(history[1]["final_success"], true);

    let reset: Value = http.post(format!("{base}/api/reset")).send().await.unwrap().json().await.unwrap();
    assert_eq!(reset["success"], true);
    let history: Value = http.get(format!("{base}/api/history")).send().await.unwrap().json().await.unwrap();
    assert_eq!(history, json!([]));
}

#[tokio::test]
async fn init_without_model_is_rejected() {
    let session = session_with(ScriptedModel::new(vec![]), FakeDevice::new());
    let addr = spawn_server(session).await;
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/init"))
        .json(&json!({"base_url": "http://localhost:8080/v1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "model_name is required");
}

#[tokio::test]
async fn chat_before_init_is_a_client_error() {
    let session = session_with(ScriptedModel::new(vec![]), FakeDevice::new());
    let addr = spawn_server(session).await;
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/chat"))
        .json(&json!({"message": "open settings"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn blocking_chat_reports_result() {
    let (session, _, _) = ready_session(vec![
        Scripted::Decide(decision("swipe", Action::Swipe { from: [500, 800], to: [500, 200] }, false)),
        Scripted::Decide(decision("done", Action::Finish { message: "Found it".into() }, true)),
    ]);
    let addr = spawn_server(session).await;
    let body: Value = reqwest::Client::new()
        .post(format!("http://{addr}/api/chat"))
        .json(&json!({"message": "find the photo"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"result": "Found it", "steps": 2, "success": true}));
}

#[tokio::test]
async fn screenshot_before_first_poll_is_not_available() {
    let device = FakeDevice::new();
    let session = session_with(ScriptedModel::new(vec![]), device);
    let addr = spawn_server(session.clone()).await;
    let http = reqwest::Client::new();

    let body: Value = http
        .post(format!("http://{addr}/api/screenshot"))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "not available");

    session.poller().poll_once().await;
    let body: Value = http
        .post(format!("http://{addr}/api/screenshot"))
        .json(&json!({"device_id": null}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["width"], 1080);
    assert_eq!(body["is_sensitive"], false);
    assert!(body.get("error").is_none());
    assert!(!body["image"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn backend_failure_maps_to_service_unavailable() {
    let factory = FakeBackends { model: ScriptedModel::new(vec![]), device: FakeDevice::new(), model_unavailable: true };
    let addr = spawn_server(PhoneSession::new(Arc::new(factory))).await;
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/init"))
        .json(&json!({"model_name": "autoglm-phone-9b"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = resp.json().await.unwrap();
    assert!(!body["message"].as_str().unwrap().contains("connection refused"));
}

#[tokio::test]
async fn reset_during_blocking_chat_reports_cancellation() {
    let gate = Arc::new(tokio::sync::Notify::new());
    let (session, model, _) = ready_session(vec![Scripted::Gated(gate, decision("wait", Action::Home, true))]);
    let addr = spawn_server(session).await;
    let http = reqwest::Client::new();

    let chat = tokio::spawn({
        let http = http.clone();
        async move {
            http.post(format!("http://{addr}/api/chat"))
                .json(&json!({"message": "open settings"}))
                .send()
                .await
                .unwrap()
        }
    });
    while model.calls.load(std::sync::atomic::Ordering::SeqCst) == 0 {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    http.post(format!("http://{addr}/api/reset")).send().await.unwrap();

    let resp = chat.await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"success": false, "message": "Task cancelled"}));
}
