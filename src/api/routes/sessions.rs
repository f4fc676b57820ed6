//! Contact workflow session routes.
//!
//! - `POST /sessions` opens a session for a user, provider and transcript
//! - `GET /sessions/:id` returns the session snapshot
//! - `POST /sessions/:id/commands` queues a command
//! - `GET /sessions/:id/events` drains events, optionally long-polling
//! - `DELETE /sessions/:id` closes the session

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::credentials::Provider;
use crate::suggestions::Transcript;
use crate::workflow::{SessionCommand, SessionContext, SessionEvent, SessionRegistry, SessionSnapshot};

/// Longest a client may long-poll for events.
const MAX_EVENT_WAIT_MS: u64 = 30_000;

#[derive(Debug, Deserialize)]
pub struct OpenSessionRequest {
    pub user_id: String,
    pub provider: Provider,
    pub transcript: Transcript,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventQuery {
    /// Milliseconds to wait for the first event.
    pub wait_ms: Option<u64>,
}

pub fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/", post(open_session))
        .route("/:id", get(get_session).delete(close_session))
        .route("/:id/commands", post(send_command))
        .route("/:id/events", get(poll_events))
        .with_state(registry)
}

async fn open_session(
    State(registry): State<Arc<SessionRegistry>>,
    Json(req): Json<OpenSessionRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if req.user_id.trim().is_empty() {
        return Err(ApiError::bad_request("user_id is required"));
    }
    if !registry.services().gateway.supports(req.provider) {
        return Err(ApiError::bad_request(format!(
            "{} is not configured",
            req.provider.display_name()
        )));
    }

    let id = registry
        .open(SessionContext {
            user_id: req.user_id,
            provider: req.provider,
            transcript: req.transcript,
        })
        .await;

    Ok((StatusCode::CREATED, Json(json!({ "session_id": id }))))
}

async fn get_session(
    State(registry): State<Arc<SessionRegistry>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SessionSnapshot>> {
    Ok(Json(registry.snapshot(id).await?))
}

async fn send_command(
    State(registry): State<Arc<SessionRegistry>>,
    Path(id): Path<Uuid>,
    Json(command): Json<SessionCommand>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    registry.send(id, command).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": true }))))
}

async fn poll_events(
    State(registry): State<Arc<SessionRegistry>>,
    Path(id): Path<Uuid>,
    Query(query): Query<EventQuery>,
) -> ApiResult<Json<Vec<SessionEvent>>> {
    let wait = Duration::from_millis(query.wait_ms.unwrap_or(0).min(MAX_EVENT_WAIT_MS));
    Ok(Json(registry.events(id, wait).await?))
}

async fn close_session(
    State(registry): State<Arc<SessionRegistry>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    registry.close(id).await?;
    info!("Session {} closed via API", id);
    Ok(StatusCode::NO_CONTENT)
}
