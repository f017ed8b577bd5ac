
use prometheus::{Encoder, TextEncoder, Registry, IntCounterVec, IntGauge, HistogramVec};
use lazy_static::lazy_static;
use std::sync::OnceLock;
use axum::response::IntoResponse;
use axum::http::StatusCode;
use tracing::warn;
lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static SESSION_CONSTRUCTIONS: OnceLock<IntCounterVec> = OnceLock::new();
static SESSION_EVICTIONS: OnceLock<IntCounterVec> = OnceLock::new();
static LOADED_SESSIONS: OnceLock<IntGauge> = OnceLock::new();
static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();
pub fn init_metrics() {
    let req_counter = REQ_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("requests_total", "Total requests per route"),
            &["route", "status"]
        ).expect("valid requests_total definition")
    });

    let constructions = SESSION_CONSTRUCTIONS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("session_constructions_total", "Inference sessions constructed"),
            &["model", "backend"]
        ).expect("valid session_constructions_total definition")
    });

    let evictions = SESSION_EVICTIONS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("session_evictions_total", "Idle sessions evicted over capacity"),
            &["model"]
        ).expect("valid session_evictions_total definition")
    });

    let loaded_sessions = LOADED_SESSIONS.get_or_init(|| {
        IntGauge::new("loaded_sessions", "Inference sessions currently cached").expect("valid loaded_sessions definition")
    });

    let stage_duration = STAGE_DURATION.get_or_init(|| {
        HistogramVec::new(
            prometheus::HistogramOpts::new(
                "stage_duration_seconds",
                "Time spent per removal pipeline stage"
            ).buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["stage"]
        ).expect("valid stage_duration_seconds definition")
    });
    REGISTRY.register(Box::new(req_counter.clone())).ok();
    REGISTRY.register(Box::new(constructions.clone())).ok();
    REGISTRY.register(Box::new(evictions.clone())).ok();
    REGISTRY.register(Box::new(loaded_sessions.clone())).ok();
    REGISTRY.register(Box::new(stage_duration.clone())).ok();
}
pub fn inc_request(route: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status]).inc();
    }
}
pub fn inc_session_construction(model: &str, backend: &str) {
    if let Some(counter) = SESSION_CONSTRUCTIONS.get() {
        counter.with_label_values(&[model, backend]).inc();
    }
}
pub fn inc_session_eviction(model: &str) {
    if let Some(counter) = SESSION_EVICTIONS.get() {
        counter.with_label_values(&[model]).inc();
    }
}
pub fn set_loaded_sessions(count: usize) {
    if let Some(gauge) = LOADED_SESSIONS.get() {
        gauge.set(count as i64);
    }
}
pub fn observe_stage(stage: &str, seconds: f64) {
    if let Some(histogram) = STAGE_DURATION.get() {
        histogram.with_label_values(&[stage]).observe(seconds);
    }
}
pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; version=0.0.4")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_construction_counter_is_exported() {
        init_metrics();
        inc_session_construction("metrics-test-model", "fallback");
        observe_stage("inference", 0.2);

        let response = get_metrics().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("session_constructions_total"));
        assert!(text.contains("metrics-test-model"));
    }

    #[test]
    fn test_init_is_idempotent() {
        init_metrics();
        init_metrics();
        set_loaded_sessions(3);
    }
}
