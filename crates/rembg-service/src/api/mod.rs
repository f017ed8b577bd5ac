// rembg-service/src/api/mod.rs
//! API module - HTTP handlers over the removal pipeline

pub mod remove_api;
pub mod image_api;
pub mod health_api;

// Re-export API handlers
pub use remove_api::{remove_background, RemoveParams, RemoveJsonResponse};
pub use image_api::get_image;
pub use health_api::healthz;
