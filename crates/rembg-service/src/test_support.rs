//! Fakes shared by the unit test suites.
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};

use crate::model_runtime::{BackgroundSession, ExecutionBackend, ModelCatalog, SessionFactory};

/// Session whose mask is an opaque centered square covering half of each side.
pub struct StaticMaskSession {
    name: String,
    backend: ExecutionBackend,
    fail: bool,
}

impl StaticMaskSession {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            backend: ExecutionBackend::Fallback,
            fail: false,
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name)
        }
    }
}

impl BackgroundSession for StaticMaskSession {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> ExecutionBackend {
        self.backend
    }

    fn predict_mask(&self, image: &DynamicImage) -> anyhow::Result<GrayImage> {
        if self.fail {
            anyhow::bail!("accelerator out of memory");
        }
        let (w, h) = (image.width(), image.height());
        Ok(GrayImage::from_fn(w, h, |x, y| {
            let inside = x >= w / 4 && x < w - w / 4 && y >= h / 4 && y < h - h / 4;
            Luma([if inside { 255 } else { 0 }])
        }))
    }
}

/// Factory that counts constructions. Names missing from the catalog fail,
/// as do names listed in `broken`; sessions for names in `failing_inference`
/// fail at prediction time. `attempts` counts every call, failed or not.
pub struct CountingFactory {
    pub delay: Duration,
    pub attempts: AtomicUsize,
    pub total: AtomicUsize,
    pub per_model: DashMap<String, usize>,
    pub broken: Vec<String>,
    pub failing_inference: Vec<String>,
}

impl CountingFactory {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(0),
            attempts: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            per_model: DashMap::new(),
            broken: Vec::new(),
            failing_inference: Vec::new(),
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    pub fn constructions(&self, model: &str) -> usize {
        self.per_model.get(model).map(|count| *count).unwrap_or(0)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

impl SessionFactory for CountingFactory {
    fn create(&self, model_name: &str) -> anyhow::Result<Arc<dyn BackgroundSession>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        if ModelCatalog::lookup(model_name).is_none() || self.broken.iter().any(|b| b == model_name) {
            anyhow::bail!("unknown model '{}'", model_name);
        }
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.per_model.entry(model_name.to_string()).or_insert(0) += 1;

        let session = if self.failing_inference.iter().any(|f| f == model_name) {
            StaticMaskSession::failing(model_name)
        } else {
            StaticMaskSession::new(model_name)
        };
        Ok(Arc::new(session))
    }
}

fn gradient(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    }))
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buffer = Vec::new();
    gradient(width, height)
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .unwrap();
    buffer
}

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buffer = Vec::new();
    gradient(width, height)
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Jpeg)
        .unwrap();
    buffer
}

pub const BOUNDARY: &str = "rembg-test-boundary";

/// multipart/form-data body with a single part named `field`.
pub fn multipart_body(field: &str, filename: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            field, filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}

/// Store whose writes and listings always fail.
pub struct BrokenStore;

#[async_trait::async_trait]
impl crate::artifact_store::ArtifactStore for BrokenStore {
    async fn put(&self, _bytes: bytes::Bytes) -> anyhow::Result<String> {
        anyhow::bail!("volume is read-only")
    }

    async fn get(&self, _id: &str) -> anyhow::Result<Option<bytes::Bytes>> {
        Ok(None)
    }

    async fn exists(&self, _id: &str) -> bool {
        false
    }

    async fn count(&self) -> Option<usize> {
        None
    }

    fn describe(&self) -> String {
        "broken".to_string()
    }
}
