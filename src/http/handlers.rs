use super::state::AppState;
use crate::error::SessionError;
use crate::session::{
    LanguageCode, LocationSummary, SessionDiagnostics, SessionStatus, SpeakingFlags, Utterance,
};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

// ============================================================================
// Request/Response Types
// ============================================================================

/// Location as supplied by the caller
///
/// Variants are tried in order; coordinates come first because every field
/// of a summary is optional.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum LocationRequest {
    Coordinates { latitude: f64, longitude: f64 },
    Summary(LocationSummary),
    Text(String),
}

impl From<LocationRequest> for LocationSummary {
    fn from(req: LocationRequest) -> Self {
        match req {
            LocationRequest::Summary(summary) => summary,
            LocationRequest::Coordinates {
                latitude,
                longitude,
            } => LocationSummary::from_coordinates(latitude, longitude),
            LocationRequest::Text(text) => LocationSummary::from_text(text),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StartInteractionRequest {
    pub location: Option<LocationRequest>,

    /// BCP-47 code; the configured language when omitted
    pub language: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendTextRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub status: SessionStatus,
    pub capture_level: f32,
    pub playback_level: f32,
    pub speaking: SpeakingFlags,
    pub diagnostics: Option<SessionDiagnostics>,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub status: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn ok(status: impl Into<String>, message: impl Into<String>) -> Response {
    (
        StatusCode::OK,
        Json(ActionResponse {
            status: status.into(),
            message: message.into(),
        }),
    )
        .into_response()
}

fn error_response(err: SessionError) -> Response {
    let code = match &err {
        SessionError::NotReady(_) => StatusCode::CONFLICT,
        SessionError::Capture(_) => StatusCode::SERVICE_UNAVAILABLE,
        SessionError::Config(_) => StatusCode::BAD_REQUEST,
        SessionError::ControllerGone => StatusCode::SERVICE_UNAVAILABLE,
    };
    if code.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        warn!("Request rejected: {}", err);
    }
    (
        code,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /status
/// Connection state, levels and counters
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let observers = state.controller.observe();
    let diagnostics = state.controller.diagnostics().await.ok();

    let capture_level = *observers.capture_level.borrow();
    let playback_level = *observers.playback_level.borrow();
    let speaking = *observers.speaking.borrow();

    Json(StatusResponse {
        status: state.controller.status(),
        capture_level,
        playback_level,
        speaking,
        diagnostics,
    })
}

/// GET /transcript
/// Transcript accumulated so far
pub async fn get_transcript(State(state): State<AppState>) -> Response {
    match state.controller.transcript().await {
        Ok(transcript) => (StatusCode::OK, Json::<Vec<Utterance>>(transcript)).into_response(),
        Err(e) => error_response(e),
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    let message = message.into();
    warn!("Request rejected: {}", message);
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: message })).into_response()
}

/// POST /interaction/start
/// Start capturing and streaming to the agent
///
/// A request without a JSON body uses the configured language and no location.
pub async fn start_interaction(
    State(state): State<AppState>,
    body: Result<Json<StartInteractionRequest>, JsonRejection>,
) -> Response {
    let req = match body {
        Ok(Json(req)) => req,
        Err(JsonRejection::MissingJsonContentType(_)) => StartInteractionRequest::default(),
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    let language = match req.language.as_deref().map(str::parse::<LanguageCode>) {
        Some(Ok(language)) => Some(language),
        Some(Err(e)) => return error_response(SessionError::Config(e)),
        None => None,
    };
    let location = req.location.map(LocationSummary::from);

    info!("Starting interaction via HTTP");

    match state.controller.start_interaction(location, language).await {
        Ok(()) => ok("interacting", "Interaction started"),
        Err(e) => error_response(e),
    }
}

/// POST /interaction/stop
pub async fn stop_interaction(State(state): State<AppState>) -> Response {
    match state.controller.stop_interaction().await {
        Ok(()) => ok("connected", "Interaction stopped"),
        Err(e) => error_response(e),
    }
}

/// POST /interrupt
/// Silence the agent immediately
pub async fn interrupt(State(state): State<AppState>) -> Response {
    match state.controller.interrupt().await {
        Ok(()) => ok("interrupted", "Playback interrupted"),
        Err(e) => error_response(e),
    }
}

/// POST /reconnect
/// Reset the attempt counter and connect again
pub async fn reconnect(State(state): State<AppState>) -> Response {
    match state.controller.retry().await {
        Ok(()) => ok("connecting", "Reconnecting"),
        Err(e) => error_response(e),
    }
}

/// POST /text
/// Send a typed message to the agent
pub async fn send_text(
    State(state): State<AppState>,
    Json(req): Json<SendTextRequest>,
) -> Response {
    if req.text.trim().is_empty() {
        return bad_request("text must not be empty");
    }
    match state.controller.send_text(req.text).await {
        Ok(()) => ok("sent", "Text sent"),
        Err(e) => error_response(e),
    }
}
