//! Nexus HTTP API
//!
//! Axum server exposing the session over HTTP alongside the Unix socket IPC
//! server. Each endpoint is a thin handler over an inner function returning
//! `(StatusCode, Value)`, so the logic is testable without axum dispatch.
//!
//! Endpoints:
//! - GET  /health, /version
//! - POST /documents, /documents/stream (SSE)
//! - GET  /report, /timeline, /insights, /conversation
//! - POST /timeline/remove, /insights/refresh, /session/reset
//! - POST /chat, /chat/stream (SSE)
//!
//! Streaming endpoints emit `delta` events, then one `done` or `error` event.
//! A client disconnect cancels the in-flight engine call.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use nexus_core::models::Document;
use nexus_core::{NexusConfig, NexusError, Session};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub session: Session,
    pub config: NexusConfig,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/documents", post(ingest_handler))
        .route("/documents/stream", post(ingest_stream_handler))
        .route("/report", get(report_handler))
        .route("/timeline", get(timeline_handler))
        .route("/timeline/remove", post(remove_handler))
        .route("/insights", get(insights_handler))
        .route("/insights/refresh", post(refresh_handler))
        .route("/chat", post(chat_handler))
        .route("/chat/stream", post(chat_stream_handler))
        .route("/conversation", get(conversation_handler))
        .route("/session/reset", post(reset_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    session: Session,
    config: NexusConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", config.http.host, config.http.port);
    let state = Arc::new(HttpState { session, config });

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Nexus HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request / Response DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub documents: Vec<Document>,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub question: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Document>,
}

#[derive(Debug, Deserialize)]
pub struct RemoveRequest {
    #[serde(default)]
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ResetRequest {
    pub subject: Option<String>,
}

/// Standard HTTP error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            status: "error".to_string(),
        }
    }
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

pub fn health_inner(session: &Session, socket_path: &str) -> (StatusCode, serde_json::Value) {
    let insights = session.insights();
    (
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "records": session.records().len(),
            "generation": session.generation(),
            "insights": insights.status,
            "socket": socket_path,
        }),
    )
}

/// Inner version: returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "nexus/1",
    })
}

pub async fn ingest_inner(session: &Session, req: IngestRequest) -> (StatusCode, serde_json::Value) {
    match session
        .ingest(&req.documents, req.note.as_deref(), &CancellationToken::new())
        .await
    {
        Ok(outcome) => (StatusCode::OK, to_json(&outcome)),
        Err(e) => error_body(&e),
    }
}

pub fn report_inner(session: &Session) -> (StatusCode, serde_json::Value) {
    (StatusCode::OK, serde_json::json!({ "report": session.report() }))
}

pub fn timeline_inner(session: &Session) -> (StatusCode, serde_json::Value) {
    let records = session.timeline();
    (
        StatusCode::OK,
        serde_json::json!({
            "count": records.len(),
            "records": records,
        }),
    )
}

pub fn remove_inner(session: &Session, req: RemoveRequest) -> (StatusCode, serde_json::Value) {
    if req.ids.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            to_json(&ErrorResponse::new("ids must not be empty")),
        );
    }
    let removed = session.remove_records(&req.ids);
    (
        StatusCode::OK,
        serde_json::json!({
            "removed": removed,
            "generation": session.generation(),
        }),
    )
}

pub fn insights_inner(session: &Session) -> (StatusCode, serde_json::Value) {
    (StatusCode::OK, to_json(&session.insights()))
}

pub async fn refresh_inner(session: &Session) -> (StatusCode, serde_json::Value) {
    let outcome = session.refresh_insights().await;
    (
        StatusCode::OK,
        serde_json::json!({
            "refresh": outcome,
            "insights": session.insights(),
        }),
    )
}

pub async fn chat_inner(session: &Session, req: ChatRequest) -> (StatusCode, serde_json::Value) {
    let question = match req.question {
        Some(q) if !q.trim().is_empty() => q,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                to_json(&ErrorResponse::new("question field is required")),
            );
        }
    };

    match session
        .ask(&question, &req.attachments, &CancellationToken::new())
        .await
    {
        Ok(turn) => (StatusCode::OK, to_json(&turn)),
        Err(e) => error_body(&e),
    }
}

pub fn conversation_inner(session: &Session) -> (StatusCode, serde_json::Value) {
    (StatusCode::OK, to_json(&session.conversation()))
}

pub fn reset_inner(session: &Session, req: ResetRequest) -> (StatusCode, serde_json::Value) {
    session.reset(req.subject.as_deref());
    (StatusCode::OK, to_json(&session.snapshot()))
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.session, &state.config.service.socket_path);
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn ingest_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<IngestRequest>,
) -> impl IntoResponse {
    let (status, body) = ingest_inner(&state.session, req).await;
    (status, Json(body))
}

pub async fn report_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = report_inner(&state.session);
    (status, Json(body))
}

pub async fn timeline_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = timeline_inner(&state.session);
    (status, Json(body))
}

pub async fn remove_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<RemoveRequest>,
) -> impl IntoResponse {
    let (status, body) = remove_inner(&state.session, req);
    (status, Json(body))
}

pub async fn insights_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = insights_inner(&state.session);
    (status, Json(body))
}

pub async fn refresh_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = refresh_inner(&state.session).await;
    (status, Json(body))
}

pub async fn chat_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<ChatRequest>,
) -> impl IntoResponse {
    let (status, body) = chat_inner(&state.session, req).await;
    (status, Json(body))
}

pub async fn conversation_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = conversation_inner(&state.session);
    (status, Json(body))
}

pub async fn reset_handler(
    State(state): State<Arc<HttpState>>,
    req: Option<Json<ResetRequest>>,
) -> impl IntoResponse {
    let req = req.map(|Json(r)| r).unwrap_or_default();
    let (status, body) = reset_inner(&state.session, req);
    (status, Json(body))
}

// ============================================================================
// Streaming handlers (SSE)
// ============================================================================

pub async fn ingest_stream_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<IngestRequest>,
) -> impl IntoResponse {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let session = state.session.clone();
    let task_cancel = cancel.clone();

    tokio::spawn(async move {
        let mut sink = |delta: &str| {
            let _ = tx.send(delta_event(delta));
        };
        let result = session
            .ingest_streaming(&req.documents, req.note.as_deref(), &mut sink, &task_cancel)
            .await;
        let last = match result {
            Ok(outcome) => json_event("done", &to_json(&outcome)),
            Err(e) => json_event("error", &error_body(&e).1),
        };
        let _ = tx.send(last);
    });

    Sse::new(event_stream(rx, cancel.drop_guard())).keep_alive(KeepAlive::default())
}

pub async fn chat_stream_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<ChatRequest>,
) -> impl IntoResponse {
    let question = match req.question {
        Some(q) if !q.trim().is_empty() => q,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(to_json(&ErrorResponse::new("question field is required"))),
            )
                .into_response();
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let session = state.session.clone();
    let task_cancel = cancel.clone();

    tokio::spawn(async move {
        let mut sink = |delta: &str| {
            let _ = tx.send(delta_event(delta));
        };
        let result = session
            .ask_streaming(&question, &req.attachments, &mut sink, &task_cancel)
            .await;
        let last = match result {
            Ok(turn) => json_event("done", &to_json(&turn)),
            Err(e) => json_event("error", &error_body(&e).1),
        };
        let _ = tx.send(last);
    });

    Sse::new(event_stream(rx, cancel.drop_guard()))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Drain `rx` as SSE events. Dropping the stream (client gone) drops
/// `guard`, which cancels the producing task's engine call.
fn event_stream(
    rx: mpsc::UnboundedReceiver<Event>,
    guard: DropGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        Some((Ok(event), (rx, guard)))
    })
}

// ============================================================================
// Helpers
// ============================================================================

fn to_json<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value)
        .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string(), "status": "error" }))
}

/// SSE fields cannot carry carriage returns; newlines become extra `data:` lines.
fn delta_event(delta: &str) -> Event {
    Event::default().event("delta").data(delta.replace('\r', ""))
}

fn json_event(name: &str, body: &serde_json::Value) -> Event {
    Event::default().event(name).data(body.to_string())
}

/// HTTP status for a session error.
pub fn status_for(error: &NexusError) -> StatusCode {
    match error {
        NexusError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        NexusError::ExtractionFailed { .. } | NexusError::Engine(_) => StatusCode::BAD_GATEWAY,
        NexusError::SessionReset => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(error: &NexusError) -> (StatusCode, serde_json::Value) {
    let mut body = serde_json::json!({
        "error": error.to_string(),
        "status": "error",
    });
    if let Some(kind) = error.kind() {
        body["kind"] = serde_json::json!(kind);
    }
    if let NexusError::ExtractionFailed {
        partial: Some(partial),
        ..
    } = error
    {
        body["partial"] = serde_json::json!(partial);
    }
    (status_for(error), body)
}

// ============================================================================
// Unit Tests: call inner functions directly
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_core::FailureKind;

    #[test]
    fn test_version_inner_pure() {
        let v = version_inner();
        assert!(v["version"].is_string(), "version must be string");
        assert_eq!(v["protocol"], "nexus/1");
    }

    #[test]
    fn test_status_for_error_taxonomy() {
        assert_eq!(
            status_for(&NexusError::InvalidInput("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&NexusError::SessionReset), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&NexusError::Other("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_body_carries_kind_and_partial() {
        let error = NexusError::ExtractionFailed {
            kind: FailureKind::StreamInterrupted,
            cause: "cut".into(),
            partial: Some("2023-5-1 入".into()),
        };
        let (status, body) = error_body(&error);
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["kind"], "stream_interrupted");
        assert_eq!(body["partial"], "2023-5-1 入");
        assert_eq!(body["status"], "error");
    }

    #[test]
    fn test_error_body_without_kind() {
        let (status, body) = error_body(&NexusError::InvalidInput("empty".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.get("kind").is_none());
        assert!(body.get("partial").is_none());
    }
}
