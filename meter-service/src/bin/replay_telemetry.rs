use anyhow::{bail, Result};
use meter_service::{
    aggregation::AggregationEngine,
    clock::{Clock, SystemClock},
    config::AppConfig,
    ingestion::{IngestionAdapter, MessageRateStats},
    observability,
    persistence::{AggregateRepository, InMemoryAggregateRepository, InMemoryMeterRegistry, PgAggregateRepository},
    pipeline::{BrokerMessage, Pipeline},
    sources::BrokerReplayFileSource,
    telemetry::{InMemoryTelemetryStore, TelemetryStore},
};
use sqlx::postgres::PgPoolOptions;
use std::{env, sync::Arc, time::Duration};

/// Long enough that nothing in a capture expires during the replay.
const REPLAY_TTL: Duration = Duration::from_secs(365 * 24 * 3600);

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("usage: replay_telemetry <namespace> <ndjson_file_path> [--persist]");
    }
    let namespace = &args[1];
    let file_path = &args[2];
    let persist = args.iter().skip(3).any(|a| a == "--persist");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn TelemetryStore> = Arc::new(InMemoryTelemetryStore::new(clock.clone(), REPLAY_TTL, REPLAY_TTL));
    let stats = Arc::new(MessageRateStats::new());

    let adapter = IngestionAdapter::new(
        namespace.clone(),
        None,
        store.clone(),
        Arc::new(InMemoryMeterRegistry::new()),
        clock.clone(),
        stats.clone(),
    );
    let pipeline: Pipeline<_, BrokerMessage, _> = Pipeline::new(BrokerReplayFileSource::new(file_path), adapter);
    pipeline.run().await?;

    let summary = stats.snapshot_and_reset().await;
    tracing::info!(
        total = summary.total,
        dropped = summary.dropped,
        meters = summary.distinct_meters,
        "replay ingested"
    );

    let memory = Arc::new(InMemoryAggregateRepository::new());
    let repo: Arc<dyn AggregateRepository> = if persist {
        // METER_SERVICE_CONFIG selects the target database.
        let cfg = AppConfig::load()?;
        let pool = PgPoolOptions::new()
            .max_connections(cfg.database.max_connections)
            .connect(&cfg.database.uri)
            .await?;
        Arc::new(PgAggregateRepository::new(pool))
    } else {
        memory.clone()
    };

    let engine = AggregationEngine::new(store.clone(), repo, clock, REPLAY_TTL, 1);
    let meters = store.time_series_meters().await?;
    let report = engine.aggregate_window(&meters, 0, i64::MAX).await?;
    tracing::info!(meters = report.meters, upserted = report.aggregates_upserted, "replay aggregated");

    if !persist {
        for agg in memory.all().await {
            println!("{}", serde_json::to_string(&agg)?);
        }
    }

    Ok(())
}
