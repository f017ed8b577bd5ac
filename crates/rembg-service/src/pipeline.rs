//! Request pipeline
//!
//! One removal request moves strictly forward through
//! read -> session -> inference -> persist. The first failing stage ends
//! the request with its typed error; later stages never run, so a failed
//! inference cannot leave an artifact behind.
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tracing::{error, info};

use crate::artifact_store::ArtifactStore;
use crate::error::ServiceError;
use crate::executor::InferenceExecutor;
use crate::metrics;
use crate::model_runtime::{InferenceOptions, SessionRegistry};

#[derive(Debug, Clone)]
pub struct Upload {
    pub bytes: Bytes,
    pub filename: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemovalRequest {
    pub model: String,
    pub options: InferenceOptions,
}

/// Wall time per stage. Observability only.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageTimings {
    pub read: Duration,
    pub session: Duration,
    pub inference: Duration,
    pub persist: Duration,
}

impl StageTimings {
    pub fn total(&self) -> Duration {
        self.read + self.session + self.inference + self.persist
    }
}

#[derive(Debug, Clone)]
pub struct RemovalOutcome {
    pub id: String,
    pub image: Bytes,
    pub model: String,
    pub timings: StageTimings,
}

impl RemovalOutcome {
    pub fn path(&self) -> String {
        format!("/img/{}", self.id)
    }
}

pub struct RemovalPipeline {
    registry: Arc<SessionRegistry>,
    executor: InferenceExecutor,
    store: Arc<dyn ArtifactStore>,
}

impl RemovalPipeline {
    pub fn new(registry: Arc<SessionRegistry>, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            registry,
            executor: InferenceExecutor::new(),
            store,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Run a removal. `upload` is awaited as the read stage so body
    /// streaming is timed and its failures typed like any other stage.
    pub async fn process<F>(&self, upload: F, request: RemovalRequest) -> Result<RemovalOutcome, ServiceError>
    where
        F: Future<Output = Result<Upload, ServiceError>>,
    {
        let started = Instant::now();
        let mut timings = StageTimings::default();

        let result = self.advance(upload, &request, &mut timings).await;
        match &result {
            Ok(outcome) => {
                info!(
                    "[rembg] timings read={:.2}s session={:.2}s infer={:.2}s persist={:.2}s total={:.2}s",
                    timings.read.as_secs_f64(),
                    timings.session.as_secs_f64(),
                    timings.inference.as_secs_f64(),
                    timings.persist.as_secs_f64(),
                    started.elapsed().as_secs_f64()
                );
                info!("[rembg] saved id={} size={} bytes model={}", outcome.id, outcome.image.len(), outcome.model);
            }
            Err(e) => {
                error!(
                    "[rembg] {} stage failed for model={} after {:.2}s: {}",
                    e.stage().as_str(),
                    request.model,
                    started.elapsed().as_secs_f64(),
                    e
                );
            }
        }
        result
    }

    async fn advance<F>(
        &self,
        upload: F,
        request: &RemovalRequest,
        timings: &mut StageTimings,
    ) -> Result<RemovalOutcome, ServiceError>
    where
        F: Future<Output = Result<Upload, ServiceError>>,
    {
        let stage = Instant::now();
        let upload = upload.await?;
        if upload.bytes.is_empty() {
            return Err(ServiceError::UploadRead("uploaded file is empty".to_string()));
        }
        timings.read = stage.elapsed();
        metrics::observe_stage("read", timings.read.as_secs_f64());
        info!(
            "[rembg] recv file name={} size={}",
            upload.filename.as_deref().unwrap_or("<unnamed>"),
            upload.bytes.len()
        );

        let stage = Instant::now();
        let session = self.registry.get_or_create(&request.model).await?;
        timings.session = stage.elapsed();
        metrics::observe_stage("session", timings.session.as_secs_f64());

        let stage = Instant::now();
        let output = self.executor.run(session, upload.bytes, request.options).await?;
        timings.inference = stage.elapsed();
        metrics::observe_stage("inference", timings.inference.as_secs_f64());

        let stage = Instant::now();
        let image = Bytes::from(output);
        let id = self
            .store
            .put(image.clone())
            .await
            .map_err(|e| ServiceError::Persist(format!("{:#}", e)))?;
        timings.persist = stage.elapsed();
        metrics::observe_stage("persist", timings.persist.as_secs_f64());

        Ok(RemovalOutcome {
            id,
            image,
            model: request.model.clone(),
            timings: *timings,
        })
    }

    /// Look up a stored artifact by id.
    pub async fn fetch(&self, id: &str) -> Result<Bytes, ServiceError> {
        match self.store.get(id).await {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) => Err(ServiceError::NotFound),
            Err(e) => {
                error!("[rembg] reading artifact {} failed: {:#}", id, e);
                Err(ServiceError::Persist(format!("artifact store read failed: {:#}", e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact_store::InMemoryArtifactStore;
    use crate::test_support::{jpeg_bytes, BrokenStore, CountingFactory};

    fn pipeline_with(factory: CountingFactory, store: Arc<dyn ArtifactStore>) -> (RemovalPipeline, Arc<CountingFactory>) {
        let factory = Arc::new(factory);
        let registry = Arc::new(SessionRegistry::new(factory.clone(), 0));
        (RemovalPipeline::new(registry, store), factory)
    }

    fn request(model: &str) -> RemovalRequest {
        RemovalRequest {
            model: model.to_string(),
            options: InferenceOptions::default(),
        }
    }

    fn upload(bytes: Vec<u8>) -> impl Future<Output = Result<Upload, ServiceError>> {
        async move {
            Ok(Upload {
                bytes: Bytes::from(bytes),
                filename: Some("photo.jpg".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn test_stored_artifact_matches_output() {
        let store = Arc::new(InMemoryArtifactStore::new());
        let (pipeline, _) = pipeline_with(CountingFactory::new(), store.clone());

        let outcome = pipeline
            .process(upload(jpeg_bytes(512, 512)), request("isnet-general-use"))
            .await
            .unwrap();

        assert_eq!(&outcome.image[..8], b"\x89PNG\r\n\x1a\n");
        assert_eq!(pipeline.fetch(&outcome.id).await.unwrap(), outcome.image);
        assert_eq!(outcome.path(), format!("/img/{}", outcome.id));
    }

    #[tokio::test]
    async fn test_inference_failure_stores_nothing() {
        let store = Arc::new(InMemoryArtifactStore::new());
        let mut factory = CountingFactory::new();
        factory.failing_inference.push("u2net".to_string());
        let (pipeline, _) = pipeline_with(factory, store.clone());

        let err = pipeline
            .process(upload(jpeg_bytes(32, 32)), request("u2net"))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Inference(_)));
        assert_eq!(store.count().await, Some(0));
    }

    #[tokio::test]
    async fn test_undecodable_upload_fails_at_inference() {
        let store = Arc::new(InMemoryArtifactStore::new());
        let (pipeline, _) = pipeline_with(CountingFactory::new(), store.clone());

        let err = pipeline
            .process(upload(b"plain text".to_vec()), request("u2net"))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Inference(_)));
        assert_eq!(store.count().await, Some(0));
    }

    #[tokio::test]
    async fn test_unknown_model_fails_at_session() {
        let store = Arc::new(InMemoryArtifactStore::new());
        let (pipeline, _) = pipeline_with(CountingFactory::new(), store.clone());

        let err = pipeline
            .process(upload(jpeg_bytes(32, 32)), request("nonexistent-model"))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::ModelLoad { .. }));
        assert_eq!(store.count().await, Some(0));
        assert!(pipeline.registry().loaded_models().is_empty());
    }

    #[tokio::test]
    async fn test_read_failure_skips_session() {
        let store = Arc::new(InMemoryArtifactStore::new());
        let (pipeline, factory) = pipeline_with(CountingFactory::new(), store);

        let failing = async { Err(ServiceError::UploadRead("connection reset".to_string())) };
        let err = pipeline.process(failing, request("u2net")).await.unwrap_err();

        assert!(matches!(err, ServiceError::UploadRead(_)));
        assert_eq!(factory.total(), 0);
    }

    #[tokio::test]
    async fn test_empty_upload_is_read_error() {
        let store = Arc::new(InMemoryArtifactStore::new());
        let (pipeline, factory) = pipeline_with(CountingFactory::new(), store);

        let err = pipeline.process(upload(Vec::new()), request("u2net")).await.unwrap_err();
        assert!(matches!(err, ServiceError::UploadRead(_)));
        assert_eq!(factory.total(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_reports_no_id() {
        let (pipeline, _) = pipeline_with(CountingFactory::new(), Arc::new(BrokenStore));

        let err = pipeline
            .process(upload(jpeg_bytes(32, 32)), request("u2net"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Persist(_)));
    }

    #[tokio::test]
    async fn test_fetch_never_issued_id() {
        let (pipeline, _) = pipeline_with(CountingFactory::new(), Arc::new(InMemoryArtifactStore::new()));
        let err = pipeline.fetch("00000000-0000-4000-8000-000000000000").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound));
    }
}
