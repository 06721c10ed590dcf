use anyhow::{Context, Result};
use glass_bridge::config::BridgeConfig;
use glass_bridge::server::{self, BridgeService};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = match BridgeConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            std::process::exit(1);
        }
    };
    if cfg.oracle.api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY is not set; computer_use jobs will fail until it is");
    }

    let service = BridgeService::from_config(&cfg).context("building remote client")?;
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.port))
        .await
        .with_context(|| format!("binding port {}", cfg.port))?;
    server::serve(listener, service).await?;
    Ok(())
}
