use larkgpt::{config::Config, db::Database, server, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();
    info!("Config: {:?}", config);

    let db = Database::new(&config)?;
    db.execute_init()?;

    let state = AppState::new(&config, db);

    info!("Starting webhook server on {}", config.http_addr);
    server::serve(&config.http_addr, state).await?;

    info!("Server stopped");
    Ok(())
}
