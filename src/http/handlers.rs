use super::state::AppState;
use crate::error::{CaptureError, ConnectionError};
use crate::recognition::TranscriptEvent;
use crate::session::{Session, SessionStats};
use crate::turn::TurnState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    /// Optional session ID (if not provided, generate one)
    pub session_id: Option<String>,
    pub target_language: Option<String>,
    pub user_level: Option<String>,
    /// Speech recognition language tag
    pub language: Option<String>,
    pub voice_profile: Option<String>,
    pub system_instruction: Option<String>,
    pub auto_start_capture: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub status: String,
    pub backend: String,
}

#[derive(Debug, Deserialize)]
pub struct SendTextRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub status: String,
    pub turn_state: TurnState,
    pub capturing: bool,
}

#[derive(Debug, Serialize)]
pub struct EndSessionResponse {
    pub session_id: String,
    pub status: String,
    pub stats: SessionStats,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

fn not_found(session_id: &str) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        format!("Session {} not found", session_id),
    )
}

fn connection_status(e: &ConnectionError) -> StatusCode {
    match e {
        ConnectionError::Closed => StatusCode::CONFLICT,
        ConnectionError::Auth(_) => StatusCode::UNAUTHORIZED,
        ConnectionError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ConnectionError::NoBackends => StatusCode::SERVICE_UNAVAILABLE,
        ConnectionError::Transient(_) | ConnectionError::Fatal(_) => StatusCode::BAD_GATEWAY,
    }
}

fn capture_status(e: &CaptureError) -> StatusCode {
    match e {
        CaptureError::PermissionDenied => StatusCode::FORBIDDEN,
        CaptureError::DeviceBusy { .. } => StatusCode::CONFLICT,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

fn status_of(session: &Session) -> SessionStatusResponse {
    SessionStatusResponse {
        session_id: session.id().to_string(),
        status: if session.is_closed() { "closed" } else { "active" }.to_string(),
        turn_state: session.turn_state(),
        capturing: session.is_capturing(),
    }
}

async fn find(state: &AppState, session_id: &str) -> Option<Arc<Session>> {
    state.sessions.read().await.get(session_id).cloned()
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /sessions
/// Connect a new conversation session
pub async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSessionRequest>>,
) -> impl IntoResponse {
    let req = body.map(|Json(req)| req).unwrap_or_default();

    let mut config = state.template.base.clone();
    config.session_id = req
        .session_id
        .unwrap_or_else(|| format!("conversation-{}", uuid::Uuid::new_v4()));
    if let Some(language) = req.target_language {
        config.target_language = language;
    }
    if let Some(level) = req.user_level {
        config.user_level = level;
    }
    if let Some(language) = req.language {
        config.language = language;
    }
    if let Some(voice) = req.voice_profile {
        config.voice_profile = voice;
    }
    if let Some(instruction) = req.system_instruction {
        config.system_instruction = instruction;
    }
    if let Some(auto) = req.auto_start_capture {
        config.auto_start_capture = auto;
    }

    let session_id = config.session_id.clone();
    info!("Creating session: {}", session_id);

    if state.sessions.read().await.contains_key(&session_id) {
        return error_response(
            StatusCode::CONFLICT,
            format!("Session {} already exists", session_id),
        );
    }

    let session = match state.template.start(config).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Failed to start session {}: {}", session_id, e);
            return error_response(
                connection_status(&e),
                format!("Failed to start session: {}", e),
            );
        }
    };

    let backend = session.stats().backend;
    {
        let mut sessions = state.sessions.write().await;
        sessions.insert(session_id.clone(), session);
    }

    info!("Session {} connected via {}", session_id, backend);

    (
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id,
            status: "connected".to_string(),
            backend,
        }),
    )
        .into_response()
}

/// GET /sessions/:session_id
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match find(&state, &session_id).await {
        Some(session) => (StatusCode::OK, Json(status_of(&session))).into_response(),
        None => not_found(&session_id),
    }
}

/// POST /sessions/:session_id/text
/// Send a user text turn
pub async fn send_text(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<SendTextRequest>,
) -> impl IntoResponse {
    let Some(session) = find(&state, &session_id).await else {
        return not_found(&session_id);
    };

    if req.text.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Text must not be empty");
    }

    match session.send_text(&req.text).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(status_of(&session))).into_response(),
        Err(e) => {
            error!("Failed to send text on {}: {}", session_id, e);
            error_response(connection_status(&e), e.to_string())
        }
    }
}

/// POST /sessions/:session_id/capture/start
pub async fn start_capture(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let Some(session) = find(&state, &session_id).await else {
        return not_found(&session_id);
    };

    match session.start_capture().await {
        Ok(_) => (StatusCode::OK, Json(status_of(&session))).into_response(),
        Err(e) => error_response(capture_status(&e), e.user_message()),
    }
}

/// POST /sessions/:session_id/capture/stop
pub async fn stop_capture(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let Some(session) = find(&state, &session_id).await else {
        return not_found(&session_id);
    };

    match session.stop_capture().await {
        Ok(_) => (StatusCode::OK, Json(status_of(&session))).into_response(),
        Err(e) => error_response(capture_status(&e), e.user_message()),
    }
}

/// POST /sessions/:session_id/audio/enable
/// The user gesture that releases queued playback
pub async fn enable_audio(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match find(&state, &session_id).await {
        Some(session) => {
            session.enable_audio();
            (StatusCode::OK, Json(status_of(&session))).into_response()
        }
        None => not_found(&session_id),
    }
}

/// POST /sessions/:session_id/end
/// Close the session and release all of its resources
pub async fn end_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    info!("Ending session: {}", session_id);

    let session = {
        let mut sessions = state.sessions.write().await;
        sessions.remove(&session_id)
    };

    match session {
        Some(session) => {
            let stats = session.end_session("ended via http").await;
            (
                StatusCode::OK,
                Json(EndSessionResponse {
                    session_id,
                    status: "closed".to_string(),
                    stats,
                }),
            )
                .into_response()
        }
        None => not_found(&session_id),
    }
}

/// GET /sessions/:session_id/stats
pub async fn get_session_stats(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match find(&state, &session_id).await {
        Some(session) => (StatusCode::OK, Json(session.stats())).into_response(),
        None => not_found(&session_id),
    }
}

/// GET /sessions/:session_id/transcript
/// Get transcript events observed so far
pub async fn get_session_transcript(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match find(&state, &session_id).await {
        Some(session) => {
            let transcript: Vec<TranscriptEvent> = session.transcript();
            (StatusCode::OK, Json(transcript)).into_response()
        }
        None => not_found(&session_id),
    }
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
