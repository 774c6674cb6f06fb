use anyhow::Context;
use notes_ratelimit::{config::AppConfig, init_tracing, run, LogFormat};
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(LogFormat::from_env());

    // Get config file path from command line or use default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config/notes.yaml".to_string());

    let config = AppConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    run(config).await.context("Server error")?;

    Ok(())
}
