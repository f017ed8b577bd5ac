//! Error taxonomy for the removal service
//!
//! Every stage of a request fails with exactly one of these variants. The
//! HTTP layer turns them into the `{"error": ...}` envelope. `NotFound` is
//! 404 and `PayloadTooLarge` 413; everything else is 500.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to load model '{model}': {message}")]
    ModelLoad { model: String, message: String },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("failed to read upload: {0}")]
    UploadRead(String),

    /// Query string that does not parse into removal parameters
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("upload exceeds the limit of {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("failed to persist artifact: {0}")]
    Persist(String),

    #[error("not found")]
    NotFound,
}

/// Pipeline stage an error belongs to, used in logs and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Read,
    Session,
    Inference,
    Persist,
    Lookup,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Read => "read",
            Stage::Session => "session",
            Stage::Inference => "inference",
            Stage::Persist => "persist",
            Stage::Lookup => "lookup",
        }
    }
}

impl ServiceError {
    pub fn model_load(model: &str, err: impl std::fmt::Display) -> Self {
        ServiceError::ModelLoad {
            model: model.to_string(),
            message: err.to_string(),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            ServiceError::ModelLoad { .. } => Stage::Session,
            ServiceError::Inference(_) => Stage::Inference,
            ServiceError::UploadRead(_)
            | ServiceError::InvalidQuery(_)
            | ServiceError::PayloadTooLarge { .. } => Stage::Read,
            ServiceError::Persist(_) => Stage::Persist,
            ServiceError::NotFound => Stage::Lookup,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::NotFound => StatusCode::NOT_FOUND,
            ServiceError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
