//! Integration tests for the intake REST flow.
//!
//! Each test spins up the intake router on a random port, plus a second
//! Axum server standing in for the touchpoint webhook, and drives the real
//! HTTP contract with reqwest.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{Json, Router, extract::State, routing::post};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use pulss_intake::error::LlmError;
use pulss_intake::intake::model::{Client, IntakeRecord};
use pulss_intake::intake::prompts::{FALLBACK_OPENING, FALLBACK_REPLY};
use pulss_intake::intake::{FinalizationDispatcher, IntakeOrchestrator, intake_routes};
use pulss_intake::llm::{CompletionRequest, CompletionResponse, GenerationAdapter, LlmProvider};
use pulss_intake::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Stub LLM: numbers its replies, or fails every call.
struct StubLlm {
    fail: bool,
    calls: Mutex<usize>,
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        if self.fail {
            return Err(LlmError::RequestFailed {
                provider: "stub".to_string(),
                reason: "HTTP 503".to_string(),
            });
        }
        let n = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        Ok(CompletionResponse {
            content: format!("reply {n} to {} messages", request.messages.len()),
            input_tokens: 0,
            output_tokens: 0,
        })
    }
}

type Captured = Arc<Mutex<Vec<Value>>>;

/// Start a webhook receiver that records every JSON body it gets.
async fn start_webhook() -> (String, Captured) {
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));

    async fn receive(State(captured): State<Captured>, Json(body): Json<Value>) -> Json<Value> {
        captured.lock().unwrap().push(body);
        Json(json!({"ok": true}))
    }

    let app = Router::new()
        .route("/webhook", post(receive))
        .with_state(Arc::clone(&captured));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://127.0.0.1:{port}/webhook"), captured)
}

struct TestServer {
    base: String,
    db: Arc<dyn Database>,
    http: reqwest::Client,
}

/// Start the intake server on a random port.
async fn start_server(llm_fails: bool, webhook_url: Option<&str>) -> TestServer {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    db.upsert_client(&Client {
        id: "client-1".into(),
        name: "Cafe Aoi".into(),
        industry: "飲食".into(),
    })
    .await
    .unwrap();

    let llm: Arc<dyn LlmProvider> = Arc::new(StubLlm {
        fail: llm_fails,
        calls: Mutex::new(0),
    });
    let generation = GenerationAdapter::new(Some(llm), "SYSTEM", Duration::from_secs(5));
    let dispatcher = FinalizationDispatcher::from_webhook(webhook_url, Duration::from_secs(2));
    let dispatcher = Arc::new(dispatcher.unwrap());
    let orchestrator = Arc::new(IntakeOrchestrator::new(
        Arc::clone(&db),
        generation,
        dispatcher,
        "送信",
        None,
    ));
    let app = intake_routes(orchestrator, "https://front.example.com/");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base: format!("http://127.0.0.1:{port}"),
        db,
        http: reqwest::Client::new(),
    }
}

impl TestServer {
    async fn post(&self, path: &str, body: Option<Value>) -> (u16, Value) {
        let mut req = self.http.post(format!("{}{path}", self.base));
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .http
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn issue(&self, client_id: &str) -> Value {
        let (status, body) = self
            .post(&format!("/api/intake/clients/{client_id}/links"), None)
            .await;
        assert_eq!(status, 200, "issue failed: {body}");
        body
    }

    async fn start(&self, token: &str) -> (u16, Value) {
        self.post(&format!("/api/intake/start/{token}"), None).await
    }

    async fn say(&self, session_id: &str, text: &str) -> (u16, Value) {
        self.post(
            &format!("/api/intake/sessions/{session_id}/messages"),
            Some(json!({"user_message": text})),
        )
        .await
    }

    async fn history_len(&self, session_id: &str) -> usize {
        let (status, body) = self
            .get(&format!("/api/intake/sessions/{session_id}/messages"))
            .await;
        assert_eq!(status, 200);
        body["messages"].as_array().unwrap().len()
    }
}

async fn wait_for_webhook(captured: &Captured, n: usize) {
    timeout(Duration::from_secs(5), async {
        while captured.lock().unwrap().len() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("webhook was not called");
}

#[tokio::test]
async fn test_health() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(false, None).await;
        let (status, body) = server.get("/health").await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_issue_is_idempotent_and_builds_url() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(false, None).await;
        let first = server.issue("client-1").await;
        let second = server.issue("client-1").await;

        assert_eq!(first["token"], second["token"]);
        assert_eq!(first["status"], "active");
        let token = first["token"].as_str().unwrap();
        assert_eq!(token.len(), 32);
        assert_eq!(
            first["url"],
            format!("https://front.example.com/intake/client-1/{token}")
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_issue_with_bad_body_is_400() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(false, None).await;
        let (status, _) = server
            .post(
                "/api/intake/clients/client-1/links",
                Some(json!({"expires_at": "tomorrow"})),
            )
            .await;
        assert_eq!(status, 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_post_message_with_bad_body_is_400() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(false, None).await;
        let token = server.issue("client-1").await["token"].as_str().unwrap().to_string();
        let (status, started) = server.start(&token).await;
        assert_eq!(status, 200);
        let session_id = started["session_id"].as_str().unwrap();
        let path = format!("/api/intake/sessions/{session_id}/messages");

        let (status, body) = server.post(&path, Some(json!({}))).await;
        assert_eq!(status, 400);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid request body"));

        // No Content-Type header at all.
        let resp = server
            .http
            .post(format!("{}{path}", server.base))
            .body(r#"{"user_message": "hi"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);

        let resp = server
            .http
            .post(format!("{}{path}", server.base))
            .body("user_message=hi")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].is_string());

        // Rejected bodies append nothing: opening plus the one good turn.
        assert_eq!(server.history_len(session_id).await, 3);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_token_is_single_use() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(false, None).await;
        let link = server.issue("client-1").await;
        let token = link["token"].as_str().unwrap();

        let (status, started) = server.start(token).await;
        assert_eq!(status, 200);
        assert_eq!(started["client_id"], "client-1");
        assert_eq!(started["client_name"], "Cafe Aoi");
        assert_eq!(started["first_message"], "reply 1 to 2 messages");
        let session_id = started["session_id"].as_str().unwrap();
        assert_eq!(server.history_len(session_id).await, 1);

        let (status, body) = server.start(token).await;
        assert_eq!(status, 404);
        assert_eq!(body["error"], "invalid or expired link");

        // A fresh link is issued once the old one is used.
        let next = server.issue("client-1").await;
        assert_ne!(next["token"], link["token"]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_expired_token_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(false, None).await;
        let (status, link) = server
            .post(
                "/api/intake/clients/client-1/links",
                Some(json!({"expires_at": "2020-01-01T00:00:00Z"})),
            )
            .await;
        assert_eq!(status, 200);

        let (status, body) = server.start(link["token"].as_str().unwrap()).await;
        assert_eq!(status, 404);
        assert_eq!(body["error"], "invalid or expired link");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_client_scoped_start() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(false, None).await;
        let link = server.issue("client-1").await;
        let token = link["token"].as_str().unwrap();

        let (status, _) = server
            .post(&format!("/api/intake/start/client-2/{token}"), None)
            .await;
        assert_eq!(status, 404);

        let (status, body) = server
            .post(&format!("/api/intake/start/client-1/{token}"), None)
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["client_id"], "client-1");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_full_interview_dispatches_once() {
    timeout(TEST_TIMEOUT, async {
        let (webhook_url, captured) = start_webhook().await;
        let server = start_server(false, Some(&webhook_url)).await;
        server
            .db
            .insert_intake_record(&IntakeRecord {
                id: "rec-1".into(),
                client_id: "client-1".into(),
                problem: Some("認知が低い".into()),
                current_sns: Some("Instagram".into()),
                target: Some("20代女性".into()),
                product_summary: Some("自家焙煎コーヒー".into()),
                strengths_usp: Some("駅前".into()),
                brand_story: Some("創業30年".into()),
                submitted_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let link = server.issue("client-1").await;
        let (_, started) = server.start(link["token"].as_str().unwrap()).await;
        let session_id = started["session_id"].as_str().unwrap().to_string();

        let (status, turn) = server.say(&session_id, "こんにちは").await;
        assert_eq!(status, 200);
        assert_eq!(turn["done"], false);
        assert_eq!(server.history_len(&session_id).await, 3);

        let (status, last) = server.say(&session_id, "送信").await;
        assert_eq!(status, 200);
        assert_eq!(last["done"], true);
        assert_eq!(server.history_len(&session_id).await, 5);

        let (status, session) = server
            .get(&format!("/api/intake/sessions/{session_id}"))
            .await;
        assert_eq!(status, 200);
        assert_eq!(session["status"], "finalized");
        assert_eq!(session["final_report"], last["assistant_message"]);

        let (status, body) = server.say(&session_id, "hi").await;
        assert_eq!(status, 404);
        assert_eq!(body["error"], "session unavailable");
        assert_eq!(server.history_len(&session_id).await, 5);

        wait_for_webhook(&captured, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let payloads = captured.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        let payload = &payloads[0];
        assert_eq!(payload["client_id"], "client-1");
        assert_eq!(payload["client_name"], "Cafe Aoi");
        assert_eq!(payload["industry"], "飲食");
        assert_eq!(payload["session_id"], session_id.as_str());
        assert_eq!(payload["final_report"], last["assistant_message"]);
        assert_eq!(payload["pulse_report"]["needs"], "認知が低い");
        assert_eq!(payload["pulse_report"]["target_goal"], "20代女性");
        assert_eq!(payload["pulse_report"]["usp"], "駅前");
        assert_eq!(payload["pulse_report"]["brand_story"], "創業30年");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_generation_outage_uses_fallbacks_and_still_finalizes() {
    timeout(TEST_TIMEOUT, async {
        let (webhook_url, captured) = start_webhook().await;
        let server = start_server(true, Some(&webhook_url)).await;

        let link = server.issue("client-1").await;
        let (status, started) = server.start(link["token"].as_str().unwrap()).await;
        assert_eq!(status, 200);
        assert_eq!(started["first_message"], FALLBACK_OPENING);
        let session_id = started["session_id"].as_str().unwrap().to_string();

        let (status, turn) = server.say(&session_id, "こんにちは").await;
        assert_eq!(status, 200);
        assert_eq!(turn["assistant_message"], FALLBACK_REPLY);
        assert_eq!(turn["done"], false);

        let (status, last) = server.say(&session_id, " 送信 ").await;
        assert_eq!(status, 200);
        assert_eq!(last["assistant_message"], FALLBACK_REPLY);
        assert_eq!(last["done"], true);

        wait_for_webhook(&captured, 1).await;
        let payloads = captured.lock().unwrap();
        // No intake record stored: nested fields are null.
        assert!(payloads[0]["pulse_report"]["needs"].is_null());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_unreachable_webhook_does_not_affect_response() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(false, Some("http://127.0.0.1:9/webhook")).await;
        let link = server.issue("client-1").await;
        let (_, started) = server.start(link["token"].as_str().unwrap()).await;
        let session_id = started["session_id"].as_str().unwrap();

        let (status, last) = server.say(session_id, "送信").await;
        assert_eq!(status, 200);
        assert_eq!(last["done"], true);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_unknown_and_malformed_sessions() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(false, None).await;
        let unknown = uuid::Uuid::new_v4();

        let (status, body) = server.say(&unknown.to_string(), "hi").await;
        assert_eq!(status, 404);
        assert_eq!(body["error"], "session unavailable");

        let (status, _) = server.say("not-a-uuid", "hi").await;
        assert_eq!(status, 400);

        let (status, _) = server.get("/api/intake/sessions/not-a-uuid").await;
        assert_eq!(status, 400);

        let (status, _) = server
            .get(&format!("/api/intake/sessions/{unknown}/messages"))
            .await;
        assert_eq!(status, 404);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_concurrent_turns_stay_paired() {
    timeout(TEST_TIMEOUT, async {
        let server = Arc::new(start_server(false, None).await);
        let link = server.issue("client-1").await;
        let (_, started) = server.start(link["token"].as_str().unwrap()).await;
        let session_id = started["session_id"].as_str().unwrap().to_string();

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let server = Arc::clone(&server);
                let session_id = session_id.clone();
                tokio::spawn(async move { server.say(&session_id, &format!("msg {i}")).await.0 })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 200);
        }

        let (_, body) = server
            .get(&format!("/api/intake/sessions/{session_id}/messages"))
            .await;
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 11);
        for (i, msg) in messages.iter().enumerate() {
            let expected = if i % 2 == 0 { "assistant" } else { "user" };
            assert_eq!(msg["role"], expected, "message {i} out of order");
        }
    })
    .await
    .expect("test timed out");
}
