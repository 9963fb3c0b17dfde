//! REST endpoints for the intake flow.
//!
//! Handlers only translate between HTTP and [`IntakeOrchestrator`]; every
//! decision lives in the orchestrator.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::error;
use uuid::Uuid;

use super::links::redact_token;
use super::model::Link;
use super::session::{IntakeOrchestrator, StartedSession};
use crate::error::IntakeError;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct IntakeState {
    pub orchestrator: Arc<IntakeOrchestrator>,
    /// Frontend root used to build shareable link URLs.
    pub front_base_url: String,
}

/// Build the Axum router with the intake REST routes and `/health`.
pub fn intake_routes(orchestrator: Arc<IntakeOrchestrator>, front_base_url: &str) -> Router {
    let state = IntakeState {
        orchestrator,
        front_base_url: front_base_url.trim_end_matches('/').to_string(),
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/intake/clients/{client_id}/links", post(issue_link))
        .route("/api/intake/start/{token}", post(start_from_token))
        .route("/api/intake/start/{client_id}/{token}", post(start_from_client_token))
        .route("/api/intake/sessions/{session_id}", get(get_session))
        .route(
            "/api/intake/sessions/{session_id}/messages",
            post(post_message).get(list_messages),
        )
        .with_state(state)
}

type ApiResponse = (StatusCode, Json<Value>);

/// Map an orchestrator error to a client-facing response.
///
/// Persistence failures are logged with `operation` and `entity` and
/// reported generically.
fn error_response(err: IntakeError, operation: &str, entity: &str) -> ApiResponse {
    match err {
        IntakeError::LinkNotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "invalid or expired link"})),
        ),
        IntakeError::SessionNotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "session unavailable"})),
        ),
        IntakeError::Persistence(e) => {
            error!(operation, entity, error = %e, "Persistence failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            )
        }
    }
}

fn parse_session_id(raw: &str) -> Result<Uuid, ApiResponse> {
    Uuid::parse_str(raw).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Invalid session ID"})),
        )
    })
}

/// Decode a JSON request body, independent of `Content-Type`.
fn parse_json_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiResponse> {
    serde_json::from_slice(body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("Invalid request body: {e}")})),
        )
    })
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "pulss-intake"
    }))
}

// ── Links ───────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct IssueLinkRequest {
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

fn link_json(link: &Link, front_base_url: &str) -> Value {
    json!({
        "id": link.id,
        "client_id": link.client_id,
        "token": link.token,
        "status": link.status,
        "created_at": link.created_at,
        "expires_at": link.expires_at,
        "url": format!("{front_base_url}/intake/{}/{}", link.client_id, link.token),
    })
}

/// The body is optional; an empty body issues a link with default expiry.
async fn issue_link(
    State(state): State<IntakeState>,
    Path(client_id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        IssueLinkRequest::default()
    } else {
        match parse_json_body::<IssueLinkRequest>(&body) {
            Ok(req) => req,
            Err(resp) => return resp,
        }
    };

    match state
        .orchestrator
        .issue_link(&client_id, request.expires_at)
        .await
    {
        Ok(link) => (StatusCode::OK, Json(link_json(&link, &state.front_base_url))),
        Err(e) => error_response(e, "issue_link", &client_id),
    }
}

// ── Session start ───────────────────────────────────────────────────────

fn started_json(started: &StartedSession) -> Value {
    json!({
        "session_id": started.session.id,
        "client_id": started.session.client_id,
        "client_name": started.client.as_ref().map(|c| c.name.as_str()),
        "first_message": started.first_message,
    })
}

async fn start_from_token(
    State(state): State<IntakeState>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.start_from_token(&token).await {
        Ok(started) => (StatusCode::OK, Json(started_json(&started))),
        Err(e) => error_response(e, "start_session", &redact_token(&token)),
    }
}

async fn start_from_client_token(
    State(state): State<IntakeState>,
    Path((client_id, token)): Path<(String, String)>,
) -> impl IntoResponse {
    match state
        .orchestrator
        .start_from_client_token(&client_id, &token)
        .await
    {
        Ok(started) => (StatusCode::OK, Json(started_json(&started))),
        Err(e) => error_response(e, "start_session", &redact_token(&token)),
    }
}

// ── Conversation ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PostMessageRequest {
    user_message: String,
}

async fn post_message(
    State(state): State<IntakeState>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let id = match parse_session_id(&session_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let body = match parse_json_body::<PostMessageRequest>(&body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    match state.orchestrator.post_message(id, &body.user_message).await {
        Ok(turn) => (
            StatusCode::OK,
            Json(json!({
                "assistant_message": turn.assistant_message,
                "done": turn.done,
            })),
        ),
        Err(e) => error_response(e, "post_message", &session_id),
    }
}

async fn get_session(
    State(state): State<IntakeState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let id = match parse_session_id(&session_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.orchestrator.get_session(id).await {
        Ok(session) => (StatusCode::OK, Json(json!(session))),
        Err(e) => error_response(e, "get_session", &session_id),
    }
}

async fn list_messages(
    State(state): State<IntakeState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let id = match parse_session_id(&session_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.orchestrator.history(id).await {
        Ok(messages) => (
            StatusCode::OK,
            Json(json!({
                "session_id": id,
                "messages": messages,
            })),
        ),
        Err(e) => error_response(e, "list_messages", &session_id),
    }
}
