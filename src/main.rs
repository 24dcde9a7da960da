use anyhow::Context;
use authgate::{config::GatewayConfig, init_gateway, observability::init_tracing};
use std::env;
use std::process;

#[tokio::main]
async fn main() {
    // Get config file path from command line or use default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config/authgate.yaml".to_string());

    if let Err(e) = run(&config_path).await {
        eprintln!("authgate: {:#}", e);
        eprintln!("Usage: authgate [config_file]");
        process::exit(1);
    }
}

async fn run(config_path: &str) -> anyhow::Result<()> {
    let config = GatewayConfig::from_file(config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;

    init_tracing(config.observability.log_format);

    init_gateway(config).await.context("gateway error")?;

    Ok(())
}
