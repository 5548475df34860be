//! Proxy round-trips against a stub upstream: promotion through the chat
//! path, hydration continuity, divergence reporting, the user write-head
//! and streaming passthrough.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Json;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tower::ServiceExt;

use tinymem_config::AppConfig;
use tinymem_server::{AppState, router};

const ADD_RESPONSE: &str =
    "Here you go:\n```go\nfunc Add(a, b int) int { return a + b }\n```\nAnything else?";
const SUB_RESPONSE: &str =
    "Sure:\n```go\nfunc Subtract(a, b int) int { return a - b }\n```";

#[derive(Clone)]
struct StubUpstream {
    /// The assistant text the stub returns next.
    reply: Arc<Mutex<String>>,
}

async fn stub_chat(State(stub): State<StubUpstream>, Json(req): Json<Value>) -> Response {
    let content = stub.reply.lock().clone();
    let streaming = req.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);
    if streaming {
        let mid = content.len() / 2;
        let mut cut = mid;
        while !content.is_char_boundary(cut) {
            cut += 1;
        }
        let (a, b) = content.split_at(cut);
        let body = format!(
            "data: {}\n\ndata: {}\n\ndata: [DONE]\n\n",
            json!({"choices": [{"delta": {"content": a}}]}),
            json!({"choices": [{"delta": {"content": b}}]}),
        );
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .body(Body::from(body))
            .unwrap()
    } else {
        Json(json!({
            "id": "cmpl-stub",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop",
            }],
        }))
        .into_response()
    }
}

/// Serve the stub on an ephemeral port; return its /v1 base URL and the
/// reply knob.
async fn spawn_stub() -> (String, Arc<Mutex<String>>) {
    let reply = Arc::new(Mutex::new(ADD_RESPONSE.to_string()));
    let stub = StubUpstream {
        reply: reply.clone(),
    };
    let app = Router::new()
        .route("/v1/chat/completions", post(stub_chat))
        .with_state(stub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/v1"), reply)
}

struct Harness {
    app: Router,
    _dir: tempfile::TempDir,
    reply: Arc<Mutex<String>>,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let (endpoint, reply) = spawn_stub().await;

    let mut config = AppConfig::default();
    config.database.database_path = dir.path().join("tinymem.db").to_string_lossy().to_string();
    config.logging.log_path = dir.path().join("tinymem.log").to_string_lossy().to_string();
    config.logging.debug = true;
    config.llm.llm_endpoint = endpoint;
    config.llm.llm_model = "stub-model".to_string();
    config.audit.enabled = false;
    config.validate().unwrap();

    let (state, _audit_handle) = AppState::build(config).unwrap();
    Harness {
        app: router(state),
        _dir: dir,
        reply,
    }
}

async fn get_json(app: &Router, uri: &str) -> Value {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK, "GET {uri}");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn chat_request(prompt: &str, stream: bool) -> Value {
    json!({
        "model": "client-chosen-model",
        "stream": stream,
        "messages": [{"role": "user", "content": prompt}],
    })
}

async fn wait_for_authoritative(app: &Router, n: u64) {
    for _ in 0..100 {
        let state = get_json(app, "/state").await;
        if state["authoritative_count"] == json!(n) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("authoritative_count never reached {n}");
}

#[tokio::test]
async fn health_reports_ok() {
    let h = harness().await;
    let body = get_json(&h.app, "/health").await;
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn first_use_promotion_through_the_chat_path() {
    let h = harness().await;
    let (status, body) = post_json(
        &h.app,
        "/v1/chat/completions",
        chat_request("Write a Go Add function", false),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // The upstream body passes through unchanged.
    assert_eq!(body["choices"][0]["message"]["content"], ADD_RESPONSE);

    let state = get_json(&h.app, "/state").await;
    assert_eq!(state["authoritative_count"], 1);
    assert_eq!(state["entities"][0]["symbol"], "Add");
    assert_eq!(state["entities"][0]["state"], "AUTHORITATIVE");
}

#[tokio::test]
async fn continuity_hydrates_prior_state_into_the_next_prompt() {
    let h = harness().await;
    post_json(
        &h.app,
        "/v1/chat/completions",
        chat_request("Write a Go Add function", false),
    )
    .await;

    *h.reply.lock() = SUB_RESPONSE.to_string();
    post_json(
        &h.app,
        "/v1/chat/completions",
        chat_request("Now write a Go Subtract function", false),
    )
    .await;

    // The second request's upstream payload carried the Add block as an
    // injected system message right before the user message.
    let debug = get_json(&h.app, "/debug/last-prompt").await;
    let messages = debug["last_prompt"]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "system");
    let prefix = messages[0]["content"].as_str().unwrap();
    assert!(prefix.contains("[CURRENT STATE: AUTHORITATIVE]"));
    assert!(prefix.contains("Entity: unknown::Add"));
    assert!(prefix.contains("func Add(a, b int) int"));
    assert_eq!(messages[1]["role"], "user");

    let state = get_json(&h.app, "/state").await;
    assert_eq!(state["authoritative_count"], 2);
}

#[tokio::test]
async fn model_override_reaches_the_upstream() {
    let h = harness().await;
    post_json(
        &h.app,
        "/v1/chat/completions",
        chat_request("Write a Go Add function", false),
    )
    .await;
    let debug = get_json(&h.app, "/debug/last-prompt").await;
    assert_eq!(debug["last_prompt"]["model"], "stub-model");
}

#[tokio::test]
async fn user_code_promotes_and_reports_fresh() {
    let h = harness().await;
    let dir = tempfile::tempdir().unwrap();
    let content = "func Add(a, b int) int { return a + b }";
    let filepath = dir.path().join("add.go");
    std::fs::write(&filepath, content).unwrap();
    let filepath = filepath.to_string_lossy().to_string();

    let (status, body) = post_json(
        &h.app,
        "/v1/user/code",
        json!({ "content": content, "filepath": filepath }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"]["promoted"], true);
    assert_eq!(
        body["outcome"]["entity_key"],
        json!(format!("{filepath}::Add"))
    );

    let state = get_json(&h.app, "/state").await;
    assert_eq!(state["authoritative_count"], 1);
    assert_eq!(state["entities"][0]["stale"], false);
}

#[tokio::test]
async fn disk_divergence_shows_in_doctor_and_blocks_promotion() {
    let h = harness().await;
    let dir = tempfile::tempdir().unwrap();
    let content = "func Add(a, b int) int { return a + b }";
    let filepath = dir.path().join("add.go");
    std::fs::write(&filepath, content).unwrap();
    let filepath_str = filepath.to_string_lossy().to_string();

    post_json(
        &h.app,
        "/v1/user/code",
        json!({ "content": content, "filepath": filepath_str }),
    )
    .await;

    // Disk diverges behind the proxy's back.
    std::fs::write(&filepath, "func Add(a, b int) int { return 42 }").unwrap();

    let doctor = get_json(&h.app, "/doctor").await;
    assert_eq!(doctor["etv"]["stale_count"], 1);

    // A model rewrite of the diverged entity must not promote; the prompt
    // carries the divergence notice instead of the stale block.
    *h.reply.lock() = format!(
        "```go {filepath_str}\nfunc Add(a, b int) int {{\n\treturn b + a\n}}\n```"
    );
    post_json(
        &h.app,
        "/v1/chat/completions",
        chat_request("Please tweak Add", false),
    )
    .await;

    let debug = get_json(&h.app, "/debug/last-prompt").await;
    let prefix = debug["last_prompt"]["messages"][0]["content"]
        .as_str()
        .unwrap();
    assert!(prefix.contains("STATE NOTICE: DISK DIVERGENCE DETECTED"));
    assert!(prefix.contains(&format!("{filepath_str}::Add")));
    assert!(!prefix.contains("[CURRENT STATE: AUTHORITATIVE]"));

    let state = get_json(&h.app, "/state").await;
    assert_eq!(state["entities"][0]["stale"], true);
    let hash = state["entities"][0]["artifact_hash"].as_str().unwrap();
    assert_eq!(hash, tinymem_store::content_hash(content), "row must still point at the baseline");
}

#[tokio::test]
async fn streaming_passes_frames_through_and_post_processes() {
    let h = harness().await;
    // Seed one entity so the memory_status event has something to announce.
    post_json(
        &h.app,
        "/v1/chat/completions",
        chat_request("Write a Go Add function", false),
    )
    .await;

    *h.reply.lock() = SUB_RESPONSE.to_string();
    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    chat_request("Now write Subtract", true).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();

    // First frame announces recall; upstream frames follow unchanged; the
    // terminator closes the stream.
    let first = body.split("\n\n").next().unwrap();
    assert!(first.starts_with("data: "));
    let event: Value = serde_json::from_str(first.trim_start_matches("data: ")).unwrap();
    assert_eq!(event["type"], "tinymem.memory_status");
    assert_eq!(event["hydrated_entities"], 1);
    assert!(body.contains(r#""delta""#));
    assert!(body.ends_with("data: [DONE]\n\n"));

    // Post-processing lands after the stream closes.
    wait_for_authoritative(&h.app, 2).await;
}

#[tokio::test]
async fn recent_lists_hashes_and_metadata_without_content() {
    let h = harness().await;
    post_json(
        &h.app,
        "/v1/chat/completions",
        chat_request("Write a Go Add function", false),
    )
    .await;

    let recent = get_json(&h.app, "/recent?n=5").await;
    let episodes = recent["episodes"].as_array().unwrap();
    assert_eq!(episodes.len(), 1);
    assert!(episodes[0]["prompt_hash"].is_string());
    assert!(episodes[0]["response_hash"].is_string());
    assert_eq!(episodes[0]["metadata"]["response_promoted"], true);
    assert!(episodes[0].get("content").is_none());
}

#[tokio::test]
async fn chat_without_a_user_message_is_rejected() {
    let h = harness().await;
    let (status, body) = post_json(
        &h.app,
        "/v1/chat/completions",
        json!({ "messages": [{"role": "system", "content": "hi"}] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("user message"));
}

#[tokio::test]
async fn upstream_failure_returns_500_with_no_state_change() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.database.database_path = dir.path().join("t.db").to_string_lossy().to_string();
    config.logging.log_path = dir.path().join("t.log").to_string_lossy().to_string();
    // Port 9 is discard; nothing listens there.
    config.llm.llm_endpoint = "http://127.0.0.1:9/v1".to_string();
    config.llm.llm_model = "m".to_string();
    let (state, _handle) = AppState::build(config).unwrap();
    let app = router(state);

    let (status, _body) = post_json(
        &app,
        "/v1/chat/completions",
        chat_request("anything", false),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let state_view = get_json(&app, "/state").await;
    assert_eq!(state_view["authoritative_count"], 0);
}

#[tokio::test]
async fn debug_reset_wipes_everything() {
    let h = harness().await;
    post_json(
        &h.app,
        "/v1/chat/completions",
        chat_request("Write a Go Add function", false),
    )
    .await;
    let (status, _) = post_json(&h.app, "/debug/reset", json!({})).await;
    assert_eq!(status, StatusCode::OK);

    let state = get_json(&h.app, "/state").await;
    assert_eq!(state["authoritative_count"], 0);
    let recent = get_json(&h.app, "/recent").await;
    assert_eq!(recent["episodes"].as_array().unwrap().len(), 0);
}
