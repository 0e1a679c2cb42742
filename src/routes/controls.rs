use crate::{server::SharedState, session::SessionStatus};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Backend is already ready, nothing to force")]
    AlreadyReady,
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match self {
            ControlError::AlreadyReady => StatusCode::CONFLICT,
        };
        (status, Json(serde_json::json!({ "detail": self.to_string() }))).into_response()
    }
}

#[derive(Serialize)]
pub struct ControlResponse {
    /// Whether the call changed anything. Repeated starts and stops are no-ops.
    changed: bool,
    status: SessionStatus,
}

fn respond(state: &SharedState, changed: bool) -> Json<ControlResponse> {
    Json(ControlResponse {
        changed,
        status: state.session.status(),
    })
}

#[instrument(skip(state))]
pub async fn start_session(State(state): State<SharedState>) -> Json<ControlResponse> {
    state.metrics.record_request("/session/start");
    let changed = state.session.start();
    respond(&state, changed)
}

#[instrument(skip(state))]
pub async fn stop_session(State(state): State<SharedState>) -> Json<ControlResponse> {
    state.metrics.record_request("/session/stop");
    let changed = state.session.stop();
    respond(&state, changed)
}

#[instrument(skip(state))]
pub async fn retry_backend(State(state): State<SharedState>) -> Json<ControlResponse> {
    state.metrics.record_request("/backend/retry");
    state.session.retry_backend();
    respond(&state, true)
}

#[instrument(skip(state))]
pub async fn force_start(
    State(state): State<SharedState>,
) -> Result<Json<ControlResponse>, ControlError> {
    state.metrics.record_request("/backend/force-start");
    if !state.session.force_start() {
        return Err(ControlError::AlreadyReady);
    }
    Ok(respond(&state, true))
}
