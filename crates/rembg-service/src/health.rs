//! Health/Status reporting
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::artifact_store::ArtifactStore;
use crate::model_runtime::{ExecutionBackend, SessionRegistry};

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub ok: bool,
    pub loaded_models: Vec<String>,
    /// `null` when the store could not be listed
    pub stored_count: Option<usize>,
    pub backends: BTreeMap<String, ExecutionBackend>,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub version: String,
}

pub struct HealthReporter {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn ArtifactStore>,
    started_at: DateTime<Utc>,
}

impl HealthReporter {
    pub fn new(registry: Arc<SessionRegistry>, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            registry,
            store,
            started_at: Utc::now(),
        }
    }

    /// Never fails; an unlistable store only blanks `stored_count`.
    pub async fn status(&self) -> HealthStatus {
        HealthStatus {
            ok: true,
            loaded_models: self.registry.loaded_models(),
            stored_count: self.store.count().await,
            backends: self.registry.backends(),
            started_at: self.started_at,
            uptime_seconds: (Utc::now() - self.started_at).num_seconds().max(0),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact_store::InMemoryArtifactStore;
    use crate::test_support::{BrokenStore, CountingFactory};

    #[tokio::test]
    async fn test_empty_store_reports_zero() {
        let registry = Arc::new(SessionRegistry::new(Arc::new(CountingFactory::new()), 0));
        let reporter = HealthReporter::new(registry, Arc::new(InMemoryArtifactStore::new()));

        let status = reporter.status().await;
        assert!(status.ok);
        assert_eq!(status.stored_count, Some(0));
        assert!(status.loaded_models.is_empty());
    }

    #[tokio::test]
    async fn test_reflects_warmed_models_only() {
        let registry = Arc::new(SessionRegistry::new(Arc::new(CountingFactory::new()), 0));
        registry.warmup("isnet-general-use").await.unwrap();
        let reporter = HealthReporter::new(registry, Arc::new(InMemoryArtifactStore::new()));

        let status = reporter.status().await;
        assert_eq!(status.loaded_models, vec!["isnet-general-use".to_string()]);
        assert_eq!(
            status.backends.get("isnet-general-use"),
            Some(&ExecutionBackend::Fallback)
        );
    }

    #[tokio::test]
    async fn test_unlistable_store_degrades_to_null() {
        let registry = Arc::new(SessionRegistry::new(Arc::new(CountingFactory::new()), 0));
        let reporter = HealthReporter::new(registry, Arc::new(BrokenStore));

        let status = reporter.status().await;
        assert!(status.ok);
        assert_eq!(status.stored_count, None);
        let json = serde_json::to_value(&status).unwrap();
        assert!(json["stored_count"].is_null());
    }
}
