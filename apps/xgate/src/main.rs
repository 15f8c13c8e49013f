use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use xgate_common::{AppConfig, AppConfigPatch};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = cli::Cli::parse();
    let config = load_config(&cli)?;

    let handle = std::sync::Arc::new(
        xgate_core::bootstrap(config)
            .await
            .context("bootstrap failed")?,
    );

    let app = axum::Router::new()
        .merge(xgate_router::public_router(handle.clone()))
        .merge(xgate_router::admin_router(handle.clone()));

    let config = handle.config.load_full();
    let bind = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    println!("listening on {bind}");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Merge order: built-in defaults < config file < environment < CLI.
fn load_config(cli: &cli::Cli) -> Result<AppConfig> {
    let mut config = match std::fs::read(&cli.config) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .with_context(|| format!("parse config file {}", cli.config))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(err) => return Err(err).with_context(|| format!("read config file {}", cli.config)),
    };

    let mut patch = AppConfigPatch::from_env().context("read environment overrides")?;
    patch.overlay(cli.as_patch());
    patch.apply_to(&mut config);
    Ok(config)
}
