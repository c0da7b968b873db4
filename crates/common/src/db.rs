use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::AppConfig;

/// Connect the PostgreSQL pool the indexing core runs against.
///
/// The batch pipeline is a single writer: one transaction is in flight at
/// a time, and bulk reads happen between commits, so the pool exists for
/// connection reuse rather than parallelism. `db_max_connections` is still
/// honoured for deployments that point other tooling at the same pool.
/// The short acquire timeout turns a down database into a startup error
/// instead of a silent hang before the first fetch window.
pub async fn create_pool(config: &AppConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await?;

    tracing::info!(
        max_connections = config.db_max_connections,
        "Connected to PostgreSQL"
    );
    Ok(pool)
}
