//! Shared application state
//!
//! Everything a handler touches lives behind an `Arc` in `AppState`, which
//! axum clones per request. The registry and the store are shared by the
//! pipeline and the health reporter, never duplicated.

use std::sync::Arc;

use crate::{
    artifact_store::ArtifactStore,
    config::Config,
    health::HealthReporter,
    model_runtime::SessionRegistry,
    pipeline::RemovalPipeline,
};

#[derive(Clone)]
pub struct AppState {
    /// Configuration (read-only after initialization)
    pub config: Arc<Config>,
    pub pipeline: Arc<RemovalPipeline>,
    pub health: Arc<HealthReporter>,
}

impl AppState {
    pub fn new(config: Config, registry: Arc<SessionRegistry>, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            config: Arc::new(config),
            pipeline: Arc::new(RemovalPipeline::new(registry.clone(), store.clone())),
            health: Arc::new(HealthReporter::new(registry, store)),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.pipeline.registry()
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        self.pipeline.store()
    }
}
