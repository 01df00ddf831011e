use anyhow::Result;
use meter_service::{
    archival::ArchivalJob,
    clock::SystemClock,
    config::AppConfig,
    observability,
    persistence::PgAggregateRepository,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;

/// Run a single archival pass regardless of `archival.enabled`.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.uri)
        .await?;

    let job = ArchivalJob::new(
        Arc::new(PgAggregateRepository::new(pool)),
        Arc::new(SystemClock),
        cfg.archival.clone(),
    );

    let run = job.run_once().await?;
    for file in &run.files {
        tracing::info!(file = %file.display(), "wrote archive file");
    }

    let stats = job.stats().await?;
    tracing::info!(
        exported = run.aggregates_exported,
        deleted = run.aggregates_deleted,
        archive_files = stats.archive_files,
        total_bytes = stats.total_bytes,
        still_eligible = stats.eligible_aggregates,
        "archival pass complete"
    );

    Ok(())
}
