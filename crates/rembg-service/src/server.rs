//! HTTP server
//!
//! Wires config into the session registry and artifact store, starts the
//! optional warmup, then serves the router until ctrl-c or SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    artifact_store::{ArtifactStore, FsArtifactStore, InMemoryArtifactStore},
    config::{Config, StoreBackend},
    model_runtime::{OnnxSessionFactory, SessionRegistry},
    shared_state::AppState,
};

/// Run the HTTP service until a shutdown signal arrives.
pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics();
    cfg.print_config();

    let store: Arc<dyn ArtifactStore> = match cfg.store_backend {
        StoreBackend::Filesystem => Arc::new(FsArtifactStore::open(&cfg.data_dir).await?),
        StoreBackend::Memory => Arc::new(InMemoryArtifactStore::new()),
    };
    info!("Artifact store: {}", store.describe());

    let factory = Arc::new(OnnxSessionFactory::new(
        &cfg.model_dir,
        cfg.execution_provider,
        cfg.intra_threads,
        cfg.accelerator_detected,
    ));
    let registry = Arc::new(SessionRegistry::new(factory, cfg.max_sessions));

    // Warmup runs alongside serving; requests never wait on it directly
    if let Some(model) = &cfg.warmup_model {
        info!("Warming up model {}", model);
        registry.warmup(model);
    }

    let addr = cfg.api_addr()?;
    let state = AppState::new(cfg, registry, store);

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = build_router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to install ctrl-c handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining connections");
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let timeout = Duration::from_secs(state.config.request_timeout_seconds);
    let max_upload = state.config.max_upload_bytes;

    Router::new()
        .route("/remove", post(crate::api::remove_api::remove_background))
        .route("/img/:id", get(crate::api::image_api::get_image))
        .route("/healthz", get(crate::api::health_api::healthz))
        .route("/metrics", get(crate::metrics::get_metrics))
        // Uploads are bounded by the tower layer, not axum's 2 MB default
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(timeout))
        .with_state(state)
}
