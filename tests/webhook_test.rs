//! Integration tests for the webhook router.
//!
//! Drives `/lark/receive` end to end with an in-memory database and fake
//! completion / delivery collaborators.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use larkgpt::cache::SeenEvents;
use larkgpt::config::ConversationConfig;
use larkgpt::db::Database;
use larkgpt::handler::CallbackHandler;
use larkgpt::lark::{EventDecoder, ReplyDispatcher};
use larkgpt::llm::CompletionGateway;
use larkgpt::server::build_router;
use larkgpt::services::{MessageService, SessionService};
use larkgpt::AppState;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

const TOKEN: &str = "verification-token";

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ReplyDispatcher for Outbox {
    async fn send_text(&self, user_id: &str, text: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((user_id.to_string(), text.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct PromptLog {
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl CompletionGateway for PromptLog {
    async fn complete(&self, prompt: &str, _user_id: &str, _channel: &str) -> anyhow::Result<String> {
        let mut prompts = self.prompts.lock().unwrap();
        prompts.push(prompt.to_string());
        Ok(format!("answer #{}", prompts.len()))
    }
}

struct TestApp {
    router: axum::Router,
    db: Database,
    outbox: Arc<Outbox>,
    completion: Arc<PromptLog>,
}

fn create_test_app() -> TestApp {
    let db = Database::open(":memory:").unwrap();
    db.execute_init().unwrap();
    let outbox = Arc::new(Outbox::default());
    let completion = Arc::new(PromptLog::default());

    let handler = CallbackHandler::new(
        Arc::new(SessionService::new(db.clone())),
        Arc::new(MessageService::new(db.clone())),
        completion.clone(),
        outbox.clone(),
        ConversationConfig::default(),
    );
    let state = Arc::new(AppState {
        handler: Arc::new(handler),
        decoder: EventDecoder::new(Some(TOKEN.to_string()), None),
        seen_events: SeenEvents::new(16),
    });

    TestApp {
        router: build_router(state),
        db,
        outbox,
        completion,
    }
}

fn message_event(event_id: &str, text: &str, token: &str) -> Value {
    json!({
        "schema": "2.0",
        "header": {
            "event_id": event_id,
            "event_type": "im.message.receive_v1",
            "create_time": "1680000000000",
            "token": token,
            "app_id": "cli_app",
            "tenant_key": "tenant"
        },
        "event": {
            "sender": {
                "sender_id": { "open_id": "ou_alice" },
                "sender_type": "user"
            },
            "message": {
                "message_id": format!("om_{}", event_id),
                "chat_id": "oc_1",
                "chat_type": "p2p",
                "message_type": "text",
                "content": json!({ "text": text }).to_string()
            }
        }
    })
}

async fn post_raw(app: &axum::Router, uri: &str, body: String) -> (StatusCode, Value, Option<String>) {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    (status, json, request_id)
}

async fn post_json(app: &axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let (status, json, _) = post_raw(app, uri, body.to_string()).await;
    (status, json)
}

/// Waits for the detached turn to deliver `count` replies.
async fn wait_for_replies(outbox: &Outbox, count: usize) -> Vec<(String, String)> {
    for _ in 0..100 {
        {
            let sent = outbox.sent.lock().unwrap();
            if sent.len() >= count {
                return sent.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    outbox.sent.lock().unwrap().clone()
}

// ─────────────────────────────────────────────────────────────────────────────
// Health
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_healthz() {
    let app = create_test_app();
    let request = Request::builder()
        .method(Method::GET)
        .uri("/healthz")
        .body(Body::empty())
        .unwrap();

    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "larkgpt");
}

// ─────────────────────────────────────────────────────────────────────────────
// Lark callback
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_url_verification_echoes_challenge() {
    let app = create_test_app();
    let payload = json!({ "challenge": "c-123", "token": TOKEN, "type": "url_verification" });

    let (status, json) = post_json(&app.router, "/lark/receive", payload).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["challenge"], "c-123");
}

#[tokio::test]
async fn test_bad_token_is_rejected() {
    let app = create_test_app();
    let (status, _) = post_json(&app.router, "/lark/receive", message_event("ev_1", "hi", "forged")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(app.outbox.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_body_is_bad_request() {
    let app = create_test_app();
    let (status, json, _) = post_raw(&app.router, "/lark/receive", "not valid json".to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_message_event_is_answered_in_background() {
    let app = create_test_app();

    let (status, _, request_id) =
        post_raw(&app.router, "/lark/receive", message_event("ev_1", "hello", TOKEN).to_string()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(request_id.is_some());

    let sent = wait_for_replies(&app.outbox, 1).await;
    assert_eq!(sent, vec![("ou_alice".to_string(), "answer #1".to_string())]);

    let session = app.db.get_latest_active_session("ou_alice").unwrap();
    assert!(session.is_some());
}

#[tokio::test]
async fn test_conversation_builds_on_previous_turns() {
    let app = create_test_app();

    post_json(&app.router, "/lark/receive", message_event("ev_1", "hi", TOKEN)).await;
    wait_for_replies(&app.outbox, 1).await;
    post_json(&app.router, "/lark/receive", message_event("ev_2", "and then?", TOKEN)).await;
    wait_for_replies(&app.outbox, 2).await;

    let prompts = app.completion.prompts.lock().unwrap().clone();
    assert_eq!(prompts, vec![
        "Q: hi\nA: ".to_string(),
        "Q: hi\nA: answer #1\nQ: and then?\nA: ".to_string(),
    ]);
}

#[tokio::test]
async fn test_redelivered_event_is_handled_once() {
    let app = create_test_app();
    let event = message_event("ev_dup", "hello", TOKEN);

    let (first, _) = post_json(&app.router, "/lark/receive", event.clone()).await;
    let (second, _) = post_json(&app.router, "/lark/receive", event).await;
    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);

    wait_for_replies(&app.outbox, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(app.outbox.sent.lock().unwrap().len(), 1);
    assert_eq!(app.completion.prompts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_close_command_over_http() {
    let app = create_test_app();

    post_json(&app.router, "/lark/receive", message_event("ev_1", "hi", TOKEN)).await;
    wait_for_replies(&app.outbox, 1).await;
    post_json(&app.router, "/lark/receive", message_event("ev_2", "/close", TOKEN)).await;
    let sent = wait_for_replies(&app.outbox, 2).await;

    assert_eq!(sent[1].1, ConversationConfig::default().close_session_reply);
    assert!(app.db.get_latest_active_session("ou_alice").unwrap().is_none());
    assert_eq!(app.completion.prompts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unsupported_message_type_is_acknowledged() {
    let app = create_test_app();
    let mut event = message_event("ev_img", "", TOKEN);
    event["event"]["message"]["message_type"] = json!("image");
    event["event"]["message"]["content"] = json!("{\"image_key\":\"img_1\"}");

    let (status, _) = post_json(&app.router, "/lark/receive", event).await;
    assert_eq!(status, StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(app.outbox.sent.lock().unwrap().is_empty());
}
