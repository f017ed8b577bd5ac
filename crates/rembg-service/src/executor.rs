//! Inference executor
//!
//! Runs one background removal: decode, predict mask, shape the output
//! according to [`InferenceOptions`], encode PNG. Holds no state of its own
//! and never retries.
use std::sync::Arc;

use bytes::Bytes;
use image::DynamicImage;
use tracing::{debug, warn};

use crate::error::ServiceError;
use crate::imaging;
use crate::model_runtime::{BackgroundSession, InferenceOptions};

#[derive(Debug, Clone, Copy, Default)]
pub struct InferenceExecutor;

impl InferenceExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous body of an inference. Compute-bound; call from the
    /// blocking pool.
    pub fn run_blocking(
        &self,
        session: &dyn BackgroundSession,
        image_bytes: &[u8],
        options: &InferenceOptions,
    ) -> Result<Vec<u8>, ServiceError> {
        let image = image::load_from_memory(image_bytes)
            .map_err(|e| ServiceError::Inference(format!("cannot decode input image: {}", e)))?;
        debug!("Decoded {}x{} input for {}", image.width(), image.height(), session.model_name());

        let mut mask = session
            .predict_mask(&image)
            .map_err(|e| ServiceError::Inference(format!("{} prediction failed: {:#}", session.model_name(), e)))?;
        if (mask.width(), mask.height()) != (image.width(), image.height()) {
            return Err(ServiceError::Inference(format!(
                "{} returned a {}x{} mask for a {}x{} image",
                session.model_name(),
                mask.width(),
                mask.height(),
                image.width(),
                image.height()
            )));
        }

        if options.post_process_mask {
            mask = imaging::post_process_mask(&mask);
        }

        let output = if options.only_mask {
            DynamicImage::ImageLuma8(mask)
        } else if options.alpha_matting {
            match imaging::alpha_matting_cutout(
                &image,
                &mask,
                options.alpha_matting_foreground_threshold,
                options.alpha_matting_background_threshold,
                options.alpha_matting_erode_size,
            ) {
                Ok(cutout) => DynamicImage::ImageRgba8(cutout),
                Err(e) => {
                    warn!("Alpha matting failed, using plain cutout: {}", e);
                    DynamicImage::ImageRgba8(naive(&image, &mask)?)
                }
            }
        } else {
            DynamicImage::ImageRgba8(naive(&image, &mask)?)
        };

        imaging::encode_png(&output).map_err(|e| ServiceError::Inference(format!("{:#}", e)))
    }

    /// Run on the blocking pool. The session handle is only cloned, never
    /// mutated.
    pub async fn run(
        &self,
        session: Arc<dyn BackgroundSession>,
        image_bytes: Bytes,
        options: InferenceOptions,
    ) -> Result<Vec<u8>, ServiceError> {
        let executor = *self;
        tokio::task::spawn_blocking(move || executor.run_blocking(session.as_ref(), &image_bytes, &options))
            .await
            .map_err(|e| ServiceError::Inference(format!("inference task aborted: {}", e)))?
    }
}

fn naive(image: &DynamicImage, mask: &image::GrayImage) -> Result<image::RgbaImage, ServiceError> {
    imaging::naive_cutout(image, mask).map_err(|e| ServiceError::Inference(format!("{:#}", e)))
}
