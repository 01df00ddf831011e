pub mod hourly_aggregate_queries;
pub mod meter_registry_queries;
pub mod settlement_queries;

use anyhow::{Context, Result};
use sqlx::PgPool;

/// Round-trip a trivial query to confirm the pool can reach the database.
pub async fn ping(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .context("database ping failed")?;
    Ok(())
}
