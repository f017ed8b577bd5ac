//! Model runtime
//!
//! Turns a model name into a ready inference session and keeps it around.
//!
//! - `runtime_trait`: the session/factory seam and per-request options
//! - `model_catalog`: known models, their weights and normalization
//! - `onnx_runtime`: ONNX Runtime sessions with accelerator-then-CPU fallback
//! - `session_registry`: one shared session per model, built at most once
pub mod runtime_trait;
pub mod model_catalog;
pub mod onnx_runtime;
pub mod session_registry;
pub use runtime_trait::{BackgroundSession, ExecutionBackend, ExecutionPreference, InferenceOptions, SessionFactory};
pub use model_catalog::{ModelCatalog, ModelSpec};
pub use onnx_runtime::{OnnxSession, OnnxSessionFactory};
pub use session_registry::SessionRegistry;
