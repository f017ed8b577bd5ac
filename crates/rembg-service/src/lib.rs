// rembg-service/crates/rembg-service/src/lib.rs

pub mod api;
pub mod artifact_store;
pub mod config;
pub mod error;
pub mod executor;
pub mod health;
pub mod imaging;
pub mod metrics;
pub mod model_runtime;
pub mod pipeline;
pub mod server;
pub mod shared_state;
pub mod telemetry;

#[cfg(test)]
mod test_support;

// Public API exports
pub use artifact_store::{ArtifactStore, FsArtifactStore, InMemoryArtifactStore};
pub use config::{Config, StoreBackend};
pub use error::ServiceError;
pub use executor::InferenceExecutor;
pub use health::{HealthReporter, HealthStatus};
pub use pipeline::{RemovalOutcome, RemovalPipeline, RemovalRequest, Upload};
pub use server::{build_router, run_server};
pub use shared_state::AppState;

// API exports
pub use api::{
    remove_api::{remove_background, RemoveParams, RemoveJsonResponse},
    image_api::get_image,
    health_api::healthz,
};
