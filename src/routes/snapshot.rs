use crate::{
    cv_utils::{decode_jpg, encode_jpg, CvUtilsError, MatCanvas},
    server::SharedState,
};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("No frame has been rendered yet")]
    NoFrame,
    #[error("Failed to render snapshot: {0}")]
    Render(#[from] CvUtilsError),
}

impl IntoResponse for SnapshotError {
    fn into_response(self) -> Response {
        let status = match self {
            SnapshotError::NoFrame => StatusCode::SERVICE_UNAVAILABLE,
            SnapshotError::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Last rendered frame with its overlay burnt in.
#[instrument(skip(state))]
pub async fn snapshot(State(state): State<SharedState>) -> Result<Response, SnapshotError> {
    state.metrics.record_request("/snapshot");
    let rendered = state.session.rendered_frame();
    let frame = rendered.frame.ok_or(SnapshotError::NoFrame)?;

    let mut canvas = MatCanvas::new(decode_jpg(&frame.jpeg)?);
    rendered.overlay.replay(&mut canvas);
    let jpeg = encode_jpg(&canvas.finish()?, state.jpeg_quality)?;

    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response())
}
