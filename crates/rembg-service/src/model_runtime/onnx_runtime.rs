//! ONNX Runtime session backend
//!
//! Construction is an explicit sequence of strategies: the CUDA execution
//! provider (registered with `error_on_failure`, so a missing driver or
//! library surfaces as an error instead of a silent CPU session), then the
//! plain CPU provider. The first strategy that commits decides the
//! session's [`ExecutionBackend`] for its whole lifetime.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use image::{imageops::FilterType, DynamicImage, GrayImage};
use ndarray::Array4;
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch};
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use tracing::{info, warn};

use super::model_catalog::{ModelCatalog, ModelSpec};
use super::runtime_trait::{BackgroundSession, ExecutionBackend, ExecutionPreference, SessionFactory};
use crate::imaging;

pub struct OnnxSessionFactory {
    model_dir: PathBuf,
    preference: ExecutionPreference,
    intra_threads: usize,
    accelerator_detected: bool,
}

impl OnnxSessionFactory {
    pub fn new(
        model_dir: impl Into<PathBuf>,
        preference: ExecutionPreference,
        intra_threads: usize,
        accelerator_detected: bool,
    ) -> Self {
        Self {
            model_dir: model_dir.into(),
            preference,
            intra_threads: intra_threads.max(1),
            accelerator_detected,
        }
    }

    /// Ordered construction strategies for the configured preference.
    pub fn strategies(&self) -> Vec<ExecutionBackend> {
        match self.preference {
            ExecutionPreference::Auto if self.accelerator_detected => {
                vec![ExecutionBackend::Accelerated, ExecutionBackend::Fallback]
            }
            ExecutionPreference::Auto => vec![ExecutionBackend::Fallback],
            ExecutionPreference::Cuda => vec![ExecutionBackend::Accelerated],
            ExecutionPreference::Cpu => vec![ExecutionBackend::Fallback],
        }
    }

    fn provider_for(backend: ExecutionBackend) -> ExecutionProviderDispatch {
        match backend {
            ExecutionBackend::Accelerated => CUDAExecutionProvider::default().build().error_on_failure(),
            ExecutionBackend::Fallback => CPUExecutionProvider::default().build(),
        }
    }

    fn commit(&self, path: &Path, backend: ExecutionBackend) -> anyhow::Result<Session> {
        let session = SessionBuilder::new()?
            .with_execution_providers([Self::provider_for(backend)])?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(self.intra_threads)?
            .commit_from_file(path)?;
        Ok(session)
    }
}

impl SessionFactory for OnnxSessionFactory {
    fn create(&self, model_name: &str) -> anyhow::Result<Arc<dyn BackgroundSession>> {
        let spec = ModelCatalog::lookup(model_name).ok_or_else(|| {
            anyhow!(
                "unknown model '{}', supported models: {}",
                model_name,
                ModelCatalog::supported_models().join(", ")
            )
        })?;
        let path = ModelCatalog::weights_path(&self.model_dir, spec).ok_or_else(|| {
            anyhow!(
                "weights for '{}' not found at {}",
                model_name,
                self.model_dir.join(spec.file_name).display()
            )
        })?;

        let mut last_error = None;
        for backend in self.strategies() {
            match self.commit(&path, backend) {
                Ok(session) => {
                    info!("Committed {} session for {} from {}", backend.as_str(), model_name, path.display());
                    return Ok(Arc::new(OnnxSession::new(spec, session, backend)?));
                }
                Err(e) => {
                    warn!("{} construction for {} failed: {}", backend.as_str(), model_name, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("no execution strategy available for {}", model_name)))
    }
}

pub struct OnnxSession {
    spec: &'static ModelSpec,
    session: Session,
    output_name: String,
    backend: ExecutionBackend,
}

impl OnnxSession {
    fn new(spec: &'static ModelSpec, session: Session, backend: ExecutionBackend) -> anyhow::Result<Self> {
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .context("model declares no outputs")?;
        Ok(Self {
            spec,
            session,
            output_name,
            backend,
        })
    }

    /// NCHW float tensor: resized, scaled by the brightest channel value,
    /// then normalized with the model's mean and std.
    fn preprocess(&self, image: &DynamicImage) -> Array4<f32> {
        let (width, height) = self.spec.input_size;
        let resized = image::imageops::resize(&image.to_rgb8(), width, height, FilterType::Lanczos3);
        let max = resized.as_raw().iter().copied().max().unwrap_or(0).max(1) as f32;

        let mut input = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] =
                    (pixel[c] as f32 / max - self.spec.mean[c]) / self.spec.std[c];
            }
        }
        input
    }
}

impl BackgroundSession for OnnxSession {
    fn model_name(&self) -> &str {
        self.spec.name
    }

    fn backend(&self) -> ExecutionBackend {
        self.backend
    }

    fn predict_mask(&self, image: &DynamicImage) -> anyhow::Result<GrayImage> {
        let xs = self.preprocess(image).into_dyn();
        let outputs = self.session.run(ort::inputs![xs.view()]?)?;
        let prediction = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;

        let shape = prediction.shape();
        if shape.len() < 2 {
            return Err(anyhow!("unexpected output shape {:?}", shape));
        }
        let (pred_h, pred_w) = (shape[shape.len() - 2], shape[shape.len() - 1]);
        // first channel of the first batch item
        let values: Vec<f32> = prediction.iter().take(pred_h * pred_w).copied().collect();

        let mask = imaging::mask_from_prediction(&values, pred_w as u32, pred_h as u32)?;
        Ok(image::imageops::resize(&mask, image.width(), image.height(), FilterType::Lanczos3))
    }
}
