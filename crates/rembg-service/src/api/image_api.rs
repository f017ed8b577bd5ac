//! GET /img/:id - serve a stored artifact
use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::error::ServiceError;
use crate::metrics;
use crate::shared_state::AppState;

pub async fn get_image(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
) -> Response {
    match state.pipeline.fetch(&image_id).await {
        Ok(bytes) => {
            debug!("Serving artifact {} ({} bytes)", image_id, bytes.len());
            metrics::inc_request("img", "ok");
            ([(header::CONTENT_TYPE, "image/png")], bytes).into_response()
        }
        Err(ServiceError::NotFound) => {
            debug!("Artifact {} not found", image_id);
            metrics::inc_request("img", "not_found");
            ServiceError::NotFound.into_response()
        }
        Err(e) => {
            metrics::inc_request("img", "error");
            e.into_response()
        }
    }
}
