//! Session and factory traits shared by every model backend
//!
//! A session turns a decoded image into a foreground mask. It is built once
//! per model name by a [`SessionFactory`] and then shared read-only by all
//! requests, so implementations must be `Send + Sync` and take `&self`.

use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// Execution path a session ended up bound to at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionBackend {
    /// GPU execution provider registered successfully
    Accelerated,
    /// CPU execution, either requested or after the accelerated attempt failed
    Fallback,
}

impl ExecutionBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionBackend::Accelerated => "accelerated",
            ExecutionBackend::Fallback => "fallback",
        }
    }
}

/// Which construction strategies a factory may attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPreference {
    /// Probe for an accelerator, try it first, fall back to CPU
    Auto,
    /// Accelerated only; construction fails if the GPU provider is unavailable
    Cuda,
    /// CPU only
    Cpu,
}

impl FromStr for ExecutionPreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(ExecutionPreference::Auto),
            "cuda" | "gpu" => Ok(ExecutionPreference::Cuda),
            "cpu" => Ok(ExecutionPreference::Cpu),
            other => Err(anyhow::anyhow!(
                "unknown execution provider '{}', expected auto, cuda or cpu",
                other
            )),
        }
    }
}

/// Per-request inference flags. Never stored on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceOptions {
    /// Emit the mask itself instead of a cutout
    pub only_mask: bool,
    /// Smooth the predicted mask before use
    pub post_process_mask: bool,
    /// Run the trimap refinement pass on the cutout edges
    pub alpha_matting: bool,
    #[serde(default = "default_fg_threshold")]
    pub alpha_matting_foreground_threshold: u8,
    #[serde(default = "default_bg_threshold")]
    pub alpha_matting_background_threshold: u8,
    #[serde(default = "default_erode_size")]
    pub alpha_matting_erode_size: u8,
}

fn default_fg_threshold() -> u8 { 240 }
fn default_bg_threshold() -> u8 { 10 }
fn default_erode_size() -> u8 { 10 }

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            only_mask: false,
            post_process_mask: true,
            alpha_matting: false,
            alpha_matting_foreground_threshold: default_fg_threshold(),
            alpha_matting_background_threshold: default_bg_threshold(),
            alpha_matting_erode_size: default_erode_size(),
        }
    }
}

/// A loaded model bound to one execution backend.
pub trait BackgroundSession: Send + Sync {
    fn model_name(&self) -> &str;

    fn backend(&self) -> ExecutionBackend;

    /// Predict an 8-bit foreground mask with the same dimensions as `image`.
    fn predict_mask(&self, image: &DynamicImage) -> anyhow::Result<GrayImage>;
}

/// Builds sessions. Called from the blocking pool; may take seconds.
pub trait SessionFactory: Send + Sync {
    fn create(&self, model_name: &str) -> anyhow::Result<Arc<dyn BackgroundSession>>;
}
