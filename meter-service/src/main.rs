use std::{sync::Arc, time::Duration};

use anyhow::Result;
use meter_service::{
    aggregation::AggregationEngine,
    api::{self, ApiState},
    archival::ArchivalJob,
    clock::{Clock, SystemClock},
    commands::{CommandChannel, HttpCommandChannel},
    config::AppConfig,
    ingestion::{IngestionAdapter, MessageRateStats},
    ledger::{HttpLedgerClient, LedgerClient},
    metrics_server, observability,
    persistence::{
        AggregateRepository, MeterRegistry, PgAggregateRepository, PgMeterRegistry, PgSettlementRepository,
        SettlementRepository,
    },
    pipeline::{BrokerMessage, Pipeline},
    query::QueryService,
    scheduler::{next_boundary_delay, spawn_repeating},
    settlement::{AutoShutdownMonitor, PowerSampleBuffer, PowerSampler, SettlementEstimator, SettlementOrchestrator},
    sources::BrokerHttpSource,
    telemetry::{InMemoryTelemetryStore, TelemetryStore},
};
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr).await?;
    }

    // Connections open on first use; an unreachable database shows up in /health.
    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect_lazy(&cfg.database.uri)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(InMemoryTelemetryStore::new(
        clock.clone(),
        Duration::from_secs(cfg.telemetry.latest_ttl_secs),
        Duration::from_secs(cfg.telemetry.time_series_ttl_secs),
    ));
    let telemetry: Arc<dyn TelemetryStore> = store.clone();

    let aggregates: Arc<dyn AggregateRepository> = Arc::new(PgAggregateRepository::new(pool.clone()));
    let settlements: Arc<dyn SettlementRepository> = Arc::new(PgSettlementRepository::new(pool.clone()));
    let registry: Arc<dyn MeterRegistry> = Arc::new(PgMeterRegistry::new(pool));

    let ledger: Arc<dyn LedgerClient> = Arc::new(HttpLedgerClient::new(
        &cfg.ledger.rpc_url,
        Duration::from_millis(cfg.ledger.request_timeout_ms),
    )?);
    let commands: Arc<dyn CommandChannel> = Arc::new(HttpCommandChannel::new(
        &cfg.broker.command_publish_url,
        &cfg.broker.namespace,
    )?);

    let interval = cfg.settlement.interval();
    let buffer = Arc::new(PowerSampleBuffer::new(Duration::from_secs(cfg.sampling.window_secs)));
    let estimator = Arc::new(SettlementEstimator::new(
        telemetry.clone(),
        buffer.clone(),
        ledger.clone(),
        clock.clone(),
        interval,
        cfg.sampling.idle_deadband_w,
        cfg.settlement.ledger_timeout(),
    ));
    let monitor = cfg.sampling.auto_shutdown_enabled.then(|| {
        Arc::new(AutoShutdownMonitor::new(
            registry.clone(),
            ledger.clone(),
            commands.clone(),
            clock.clone(),
            cfg.ledger.token_address.clone(),
            cfg.sampling.safety_margin,
            Duration::from_secs(cfg.sampling.shutdown_cooldown_secs),
            cfg.settlement.ledger_timeout(),
        ))
    });
    let sampler = Arc::new(PowerSampler::new(
        telemetry.clone(),
        buffer.clone(),
        clock.clone(),
        estimator.clone(),
        monitor,
    ));
    let orchestrator = Arc::new(SettlementOrchestrator::new(
        telemetry.clone(),
        settlements.clone(),
        registry.clone(),
        ledger,
        commands,
        buffer,
        clock.clone(),
        cfg.settlement.clone(),
    ));
    let aggregation = Arc::new(AggregationEngine::new(
        telemetry.clone(),
        aggregates.clone(),
        clock.clone(),
        Duration::from_secs(cfg.telemetry.time_series_ttl_secs),
        cfg.aggregation.lookback_hours,
    ));
    let archival = cfg
        .archival
        .enabled
        .then(|| Arc::new(ArchivalJob::new(aggregates, clock.clone(), cfg.archival.clone())));

    if let Some(api_cfg) = &cfg.api {
        let query = Arc::new(QueryService::new(
            telemetry.clone(),
            settlements,
            aggregation.clone(),
            estimator,
            archival.clone(),
        ));
        api::serve(
            &api_cfg.bind_addr,
            ApiState {
                query,
                orchestrator: orchestrator.clone(),
            },
        )
        .await?;
    }

    let stats = Arc::new(MessageRateStats::new());
    let mut tasks = Vec::new();

    {
        let stats = stats.clone();
        let minute = Duration::from_secs(60);
        tasks.push(spawn_repeating("rate_stats", minute, minute, move || {
            let stats = stats.clone();
            async move { stats.log_and_reset().await }
        }));
    }

    {
        let sampler = sampler.clone();
        let period = Duration::from_millis(cfg.sampling.interval_ms.max(100));
        tasks.push(spawn_repeating("power_sampler", period, period, move || {
            let sampler = sampler.clone();
            async move { sampler.tick().await }
        }));
    }

    {
        let orchestrator = orchestrator.clone();
        let first = next_boundary_delay(clock.now_ms(), interval);
        tasks.push(spawn_repeating("settlement", first, interval, move || {
            let orchestrator = orchestrator.clone();
            async move {
                orchestrator.settle_all().await;
            }
        }));
    }

    {
        let orchestrator = orchestrator.clone();
        let period = Duration::from_secs(cfg.settlement.reconcile_interval_secs.max(1));
        tasks.push(spawn_repeating("reconcile", period, period, move || {
            let orchestrator = orchestrator.clone();
            async move {
                if let Err(e) = orchestrator.reconcile_pending().await {
                    tracing::error!(error = %e, "pending settlement reconciliation failed");
                }
            }
        }));
    }

    {
        let aggregation = aggregation.clone();
        let store = store.clone();
        let period = Duration::from_secs(cfg.aggregation.interval_secs.max(1));
        tasks.push(spawn_repeating("aggregation", period, period, move || {
            let aggregation = aggregation.clone();
            let store = store.clone();
            async move {
                if let Err(e) = aggregation.run_periodic().await {
                    tracing::error!(error = %e, "hourly aggregation failed");
                }
                let evicted = store.evict_expired().await;
                if evicted > 0 {
                    tracing::debug!(evicted, "expired telemetry evicted");
                }
            }
        }));
    }

    if let Some(job) = archival {
        let period = Duration::from_secs(cfg.archival.interval_hours.max(1) * 3600);
        tasks.push(spawn_repeating("archival", period, period, move || {
            let job = job.clone();
            async move {
                if let Err(e) = job.run_once().await {
                    tracing::error!(error = %e, "archival run failed");
                }
            }
        }));
    }

    let source = BrokerHttpSource::new(
        &cfg.broker.http_bind_addr,
        cfg.broker.channel_capacity,
        cfg.broker.max_body_bytes,
    )
    .await?;
    let adapter = IngestionAdapter::new(
        cfg.broker.namespace.clone(),
        cfg.broker.fallback_meter_id.clone(),
        telemetry,
        registry,
        clock,
        stats,
    );
    let pipeline: Pipeline<_, BrokerMessage, _> = Pipeline::new(source, adapter);

    tokio::select! {
        res = pipeline.run() => res?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
    }

    for task in tasks {
        task.abort();
    }
    Ok(())
}
