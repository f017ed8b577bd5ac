//! Known segmentation model variants and how to feed them
//!
//! Resolves a model name to its weights file and preprocessing constants.
//! Names outside this table are not rejected here; the factory reports them
//! as a load failure.
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub name: &'static str,
    pub file_name: &'static str,
    /// (width, height) the network expects
    pub input_size: (u32, u32),
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

static MODELS: &[ModelSpec] = &[
    ModelSpec {
        name: "u2net",
        file_name: "u2net.onnx",
        input_size: (320, 320),
        mean: IMAGENET_MEAN,
        std: IMAGENET_STD,
    },
    ModelSpec {
        name: "u2netp",
        file_name: "u2netp.onnx",
        input_size: (320, 320),
        mean: IMAGENET_MEAN,
        std: IMAGENET_STD,
    },
    ModelSpec {
        name: "u2net_human_seg",
        file_name: "u2net_human_seg.onnx",
        input_size: (320, 320),
        mean: IMAGENET_MEAN,
        std: IMAGENET_STD,
    },
    ModelSpec {
        name: "silueta",
        file_name: "silueta.onnx",
        input_size: (320, 320),
        mean: IMAGENET_MEAN,
        std: IMAGENET_STD,
    },
    ModelSpec {
        name: "isnet-general-use",
        file_name: "isnet-general-use.onnx",
        input_size: (1024, 1024),
        mean: [0.5, 0.5, 0.5],
        std: [1.0, 1.0, 1.0],
    },
    ModelSpec {
        name: "isnet-anime",
        file_name: "isnet-anime.onnx",
        input_size: (1024, 1024),
        mean: IMAGENET_MEAN,
        std: [1.0, 1.0, 1.0],
    },
];

pub struct ModelCatalog;

impl ModelCatalog {
    pub fn lookup(name: &str) -> Option<&'static ModelSpec> {
        MODELS.iter().find(|spec| spec.name == name)
    }

    pub fn supported_models() -> Vec<&'static str> {
        MODELS.iter().map(|spec| spec.name).collect()
    }

    /// Path of the weights file for `spec` inside `model_dir`, if present.
    pub fn weights_path(model_dir: &Path, spec: &ModelSpec) -> Option<PathBuf> {
        let path = model_dir.join(spec.file_name);
        if path.is_file() {
            debug!("Resolved weights for {}: {}", spec.name, path.display());
            Some(path)
        } else {
            None
        }
    }
}
