use crate::{overlay::DisplayList, server::SharedState, session::SessionStatus};
use axum::{extract::State, Json};
use tracing::instrument;

#[instrument(skip(state))]
pub async fn session_status(State(state): State<SharedState>) -> Json<SessionStatus> {
    state.metrics.record_request("/status");
    Json(state.session.status())
}

pub async fn overlay(State(state): State<SharedState>) -> Json<DisplayList> {
    state.metrics.record_request("/overlay");
    Json(state.session.overlay())
}
