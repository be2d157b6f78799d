use std::sync::Arc;

use coach_integrations::clock::SystemClock;
use coach_integrations::{http_server, AppState, Config};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        addr = %config.addr,
        providers = ?config.providers.keys().collect::<Vec<_>>(),
        "Starting integration gateway"
    );

    let state = AppState::build(&config, Arc::new(SystemClock)).await?;
    http_server::serve(&config, state).await
}
