// rembg-service/crates/rembg-service/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use tracing::{info, warn};
use nvml_wrapper::Nvml;

use crate::model_runtime::ExecutionPreference;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Filesystem,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "fs" | "filesystem" => Ok(StoreBackend::Filesystem),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(anyhow::anyhow!("unknown STORE_BACKEND '{}', expected fs or memory", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub model_dir: String,
    pub data_dir: String,
    pub store_backend: StoreBackend,
    pub default_model: String,
    pub warmup_model: Option<String>,
    pub execution_provider: ExecutionPreference,
    pub accelerator_detected: bool,
    pub intra_threads: usize,
    pub max_sessions: usize,
    pub request_timeout_seconds: u64,
    pub max_upload_bytes: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source; `from_env` passes the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let model_dir = lookup("MODEL_DIR")
            .or_else(|| lookup("U2NET_HOME"))
            .unwrap_or_else(|| "/models".into());

        let default_model = var("DEFAULT_MODEL", "isnet-general-use");
        let warmup_model = match lookup("WARMUP_MODEL") {
            Some(name) if name.eq_ignore_ascii_case("none") || name.is_empty() => None,
            Some(name) => Some(name),
            None => Some(default_model.clone()),
        };

        let execution_provider: ExecutionPreference = var("EXECUTION_PROVIDER", "auto")
            .parse()
            .context("EXECUTION_PROVIDER")?;
        // Only probe the driver when the choice depends on it
        let accelerator_detected = match execution_provider {
            ExecutionPreference::Auto => Self::detect_accelerator(),
            ExecutionPreference::Cuda => true,
            ExecutionPreference::Cpu => false,
        };

        let intra_threads = match var("INTRA_THREADS", "auto").as_str() {
            "auto" => Self::auto_detect_threads(),
            value => value.parse().context("INTRA_THREADS must be a number or 'auto'")?,
        };

        Ok(Self {
            api_host: var("API_HOST", "0.0.0.0"),
            api_port: var("API_PORT", "8000").parse().context("API_PORT")?,
            model_dir,
            data_dir: var("DATA_DIR", "/data"),
            store_backend: var("STORE_BACKEND", "fs").parse()?,
            default_model,
            warmup_model,
            execution_provider,
            accelerator_detected,
            intra_threads,
            max_sessions: var("MAX_SESSIONS", "0").parse().context("MAX_SESSIONS")?,
            request_timeout_seconds: var("REQUEST_TIMEOUT_SECONDS", "600")
                .parse()
                .context("REQUEST_TIMEOUT_SECONDS")?,
            max_upload_bytes: var("MAX_UPLOAD_BYTES", "33554432")
                .parse()
                .context("MAX_UPLOAD_BYTES")?,
        })
    }

    fn auto_detect_threads() -> usize {
        let num_cpus = num_cpus::get();
        info!("Auto‑detected CPU cores: {}", num_cpus);

        match num_cpus {
            0..=2 => 1,
            3..=8 => num_cpus - 1,
            _ => num_cpus / 2 + 2,
        }
    }

    fn detect_accelerator() -> bool {
        if let Ok(nvml) = Nvml::init() {
            if let Ok(device_count) = nvml.device_count() {
                if device_count > 0 {
                    if let Ok(first_gpu) = nvml.device_by_index(0) {
                        let name = first_gpu.name().unwrap_or_else(|_| "unknown".into());
                        let vram_gb = first_gpu
                            .memory_info()
                            .map(|memory| memory.total / 1024 / 1024 / 1024)
                            .unwrap_or(0);
                        info!("Detected GPU: {} ({} GB VRAM, {} device(s))", name, vram_gb, device_count);
                    }
                    return true;
                }
            }
        }
        warn!("No NVIDIA device detected, sessions will use CPU execution");
        false
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Model Dir: {}", self.model_dir);
        info!("- Store: {:?} ({})", self.store_backend, self.data_dir);
        info!("- Default Model: {}", self.default_model);
        info!("- Warmup Model: {}", self.warmup_model.as_deref().unwrap_or("disabled"));
        info!("- Execution Provider: {:?} (accelerator detected: {})", self.execution_provider, self.accelerator_detected);
        info!("- Intra-op Threads: {}", self.intra_threads);
        info!("- Max Sessions: {}", if self.max_sessions == 0 { "unbounded".to_string() } else { self.max_sessions.to_string() });
        info!("- Request Timeout: {}s", self.request_timeout_seconds);
        info!("- Max Upload: {} bytes", self.max_upload_bytes);
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("invalid API address {}:{}", self.api_host, self.api_port))
    }
}
