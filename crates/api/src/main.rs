//! Payledger API server

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use payledger_api::{router, AppState};
use payledger_billing::StripeClient;
use payledger_shared::{create_pool, run_migrations, Config};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().context("loading configuration")?;
    let pool = create_pool(&config.database_url)
        .await
        .context("connecting to database")?;
    run_migrations(&pool).await.context("running migrations")?;

    let client = StripeClient::new(&config).context("building stripe client")?;
    let state = AppState::new(&config, pool, client);

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("binding {}", config.bind_address))?;
    tracing::info!(address = %config.bind_address, "payledger api listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
