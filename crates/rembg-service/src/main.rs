// rembg-service/crates/rembg-service/src/main.rs

use rembg_service::{config::Config, run_server, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    let cfg = Config::from_env()?;
    run_server(cfg).await
}
