//! GET /healthz
use axum::{extract::State, Json};

use crate::health::HealthStatus;
use crate::metrics;
use crate::shared_state::AppState;

/// Loaded models, their backends and the stored artifact count. Always 200.
pub async fn healthz(State(state): State<AppState>) -> Json<HealthStatus> {
    let status = state.health.status().await;
    metrics::inc_request("healthz", "ok");
    Json(status)
}
