use std::sync::Arc;

use tokio::sync::watch;

use loom_common::config::{AppConfig, IndexerConfig};
use loom_common::db;
use loom_decoders::DecoderRegistry;
use loom_engine::postgres::PgStore;
use loom_indexer::handlers;
use loom_indexer::runner::Indexer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loom_indexer=info,loom_engine=info,loom_decoders=info".into()),
        )
        .json()
        .init();

    tracing::info!("Chainloom indexer starting...");

    // Load configuration
    let app = AppConfig::from_env()?;
    let config = IndexerConfig::from_file(&app.config_path)?;

    // Connect to database
    let pool = db::create_pool(&app).await?;

    // Run migrations
    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    let registry = Arc::new(DecoderRegistry::from_config(&config)?);
    let handlers = handlers::default_handlers();
    let durable = Arc::new(PgStore::new(pool));

    // Shutdown flag checked between batches; in-flight RPCs finish or time
    // out and the commit transaction is never cancelled.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal; finishing the current batch");
            let _ = shutdown_tx.send(true);
        }
    });

    let indexer = Indexer::new(config, registry, handlers, durable, shutdown_rx);
    indexer.start().await?;

    tracing::info!("Chainloom indexer stopped.");
    Ok(())
}
