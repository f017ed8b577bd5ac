//! POST /remove - upload an image, get the background removed
//!
//! The multipart field `file` carries the image; model and flags come from
//! the query string. Every failure, including malformed query strings and
//! non-multipart bodies, is answered with the `{"error": ...}` envelope.
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::QueryRejection,
        Multipart, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{de, Deserialize, Deserializer, Serialize};
use tracing::info;

use crate::error::ServiceError;
use crate::metrics;
use crate::model_runtime::InferenceOptions;
use crate::pipeline::{RemovalRequest, Upload};
use crate::shared_state::AppState;

pub const UPLOAD_FIELD: &str = "file";
pub const IMAGE_ID_HEADER: &str = "x-image-id";

#[derive(Debug, Deserialize)]
pub struct RemoveParams {
    pub model: Option<String>,
    #[serde(default, deserialize_with = "flag")]
    pub only_mask: bool,
    #[serde(default = "default_post_process_mask", deserialize_with = "flag")]
    pub post_process_mask: bool,
    #[serde(default, deserialize_with = "flag")]
    pub alpha_matting: bool,
    /// Answer with a JSON descriptor instead of the image bytes
    #[serde(default, deserialize_with = "flag")]
    pub return_json: bool,
}

fn default_post_process_mask() -> bool {
    true
}

/// Boolean query flag: `true/false`, `1/0`, `yes/no`, `on/off`, `t/f` or
/// `y/n`, case-insensitive.
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" | "t" | "y" => Ok(true),
        "false" | "0" | "no" | "off" | "f" | "n" => Ok(false),
        other => Err(de::Error::invalid_value(de::Unexpected::Str(other), &"a boolean flag")),
    }
}

fn upload_error(e: MultipartError, limit: usize) -> ServiceError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServiceError::PayloadTooLarge { limit }
    } else {
        ServiceError::UploadRead(e.body_text())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveJsonResponse {
    pub id: String,
    pub bytes: usize,
    pub path: String,
}

/// Bodies without a Content-Length get past the limit layer and only hit the
/// limit while streaming, so the multipart errors carry the 413 here.
async fn read_upload(
    multipart: Result<Multipart, MultipartRejection>,
    limit: usize,
) -> Result<Upload, ServiceError> {
    let mut multipart = multipart.map_err(|e| ServiceError::UploadRead(e.body_text()))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| upload_error(e, limit))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let bytes = field.bytes().await.map_err(|e| upload_error(e, limit))?;
        return Ok(Upload { bytes, filename });
    }

    Err(ServiceError::UploadRead(format!("multipart field '{}' is missing", UPLOAD_FIELD)))
}

pub async fn remove_background(
    State(state): State<AppState>,
    params: Result<Query<RemoveParams>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(e) => {
            metrics::inc_request("remove", "error");
            return ServiceError::InvalidQuery(e.body_text()).into_response();
        }
    };

    let model = params
        .model
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| state.config.default_model.clone());
    let request = RemovalRequest {
        model,
        options: InferenceOptions {
            only_mask: params.only_mask,
            post_process_mask: params.post_process_mask,
            alpha_matting: params.alpha_matting,
            ..Default::default()
        },
    };
    info!(
        "Removal request model={} only_mask={} post_process_mask={} alpha_matting={} return_json={}",
        request.model, params.only_mask, params.post_process_mask, params.alpha_matting, params.return_json
    );

    let upload = read_upload(multipart, state.config.max_upload_bytes);
    match state.pipeline.process(upload, request).await {
        Ok(outcome) => {
            metrics::inc_request("remove", "ok");
            if params.return_json {
                Json(RemoveJsonResponse {
                    path: outcome.path(),
                    bytes: outcome.image.len(),
                    id: outcome.id,
                })
                .into_response()
            } else {
                (
                    [
                        ("content-type", "image/png".to_string()),
                        (IMAGE_ID_HEADER, outcome.id),
                    ],
                    outcome.image,
                )
                    .into_response()
            }
        }
        Err(e) => {
            metrics::inc_request("remove", "error");
            e.into_response()
        }
    }
}
