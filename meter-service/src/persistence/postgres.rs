use meter_client::{
    db::{hourly_aggregate_queries, meter_registry_queries, settlement_queries},
    domain::{HourlyAggregate, MeterOwner, NewSettlement, SettlementFinalization, SettlementRecord},
};
use sqlx::postgres::PgPool;
use time::OffsetDateTime;

use super::{
    AggregateRepository, MeterRegistry, RepositoryError, SettlementFilter, SettlementRepository,
};

#[derive(Clone)]
pub struct PgAggregateRepository {
    pool: PgPool,
}

impl PgAggregateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AggregateRepository for PgAggregateRepository {
    async fn upsert(&self, rows: &[HourlyAggregate]) -> Result<u64, RepositoryError> {
        Ok(hourly_aggregate_queries::upsert_hourly_aggregates(&self.pool, rows).await?)
    }

    async fn history(&self, meter_id: &str, since: OffsetDateTime) -> Result<Vec<HourlyAggregate>, RepositoryError> {
        Ok(hourly_aggregate_queries::hourly_history(&self.pool, meter_id, since).await?)
    }

    async fn older_than(&self, before: OffsetDateTime, limit: i64) -> Result<Vec<HourlyAggregate>, RepositoryError> {
        Ok(hourly_aggregate_queries::aggregates_before(&self.pool, before, limit).await?)
    }

    async fn count_older_than(&self, before: OffsetDateTime) -> Result<i64, RepositoryError> {
        Ok(hourly_aggregate_queries::count_aggregates_before(&self.pool, before).await?)
    }

    async fn delete(&self, keys: &[(String, OffsetDateTime)]) -> Result<u64, RepositoryError> {
        Ok(hourly_aggregate_queries::delete_aggregates(&self.pool, keys).await?)
    }
}

#[derive(Clone)]
pub struct PgSettlementRepository {
    pool: PgPool,
}

impl PgSettlementRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain why a guarded update matched nothing.
    async fn not_pending(&self, settlement_id: &str) -> RepositoryError {
        match settlement_queries::fetch_settlement(&self.pool, settlement_id).await {
            Ok(Some(rec)) => RepositoryError::AlreadyFinal {
                settlement_id: settlement_id.to_string(),
                status: rec.status,
            },
            Ok(None) => RepositoryError::NotFound(settlement_id.to_string()),
            Err(e) => RepositoryError::Database(e),
        }
    }
}

#[async_trait::async_trait]
impl SettlementRepository for PgSettlementRepository {
    async fn create_pending(&self, new: NewSettlement) -> Result<SettlementRecord, RepositoryError> {
        Ok(settlement_queries::insert_pending_settlement(&self.pool, &new).await?)
    }

    async fn attach_tx_hash(&self, settlement_id: &str, tx_hash: &str) -> Result<SettlementRecord, RepositoryError> {
        match settlement_queries::attach_tx_hash(&self.pool, settlement_id, tx_hash).await? {
            Some(rec) => Ok(rec),
            None => Err(self.not_pending(settlement_id).await),
        }
    }

    async fn finalize(
        &self,
        settlement_id: &str,
        fin: SettlementFinalization,
    ) -> Result<SettlementRecord, RepositoryError> {
        match settlement_queries::finalize_settlement(&self.pool, settlement_id, &fin).await? {
            Some(rec) => Ok(rec),
            None => Err(self.not_pending(settlement_id).await),
        }
    }

    async fn get(&self, settlement_id: &str) -> Result<Option<SettlementRecord>, RepositoryError> {
        Ok(settlement_queries::fetch_settlement(&self.pool, settlement_id).await?)
    }

    async fn history(&self, filter: &SettlementFilter) -> Result<Vec<SettlementRecord>, RepositoryError> {
        Ok(settlement_queries::settlement_history(
            &self.pool,
            filter.meter_id.as_deref(),
            filter.owner_id.as_deref(),
            filter.limit,
        )
        .await?)
    }

    async fn latest_not_failed(&self, meter_id: &str) -> Result<Option<SettlementRecord>, RepositoryError> {
        Ok(settlement_queries::latest_open_or_settled(&self.pool, meter_id).await?)
    }

    async fn stale_pending(&self, before: OffsetDateTime) -> Result<Vec<SettlementRecord>, RepositoryError> {
        Ok(settlement_queries::stale_pending_settlements(&self.pool, before).await?)
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(meter_client::db::ping(&self.pool).await?)
    }
}

#[derive(Clone)]
pub struct PgMeterRegistry {
    pool: PgPool,
}

impl PgMeterRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl MeterRegistry for PgMeterRegistry {
    async fn touch_last_seen(&self, meter_id: &str, at: OffsetDateTime) -> Result<(), RepositoryError> {
        let updated = meter_registry_queries::touch_last_seen(&self.pool, meter_id, at).await?;
        if updated == 0 {
            tracing::debug!(meter_id, "last-seen update matched no registered meter");
        }
        Ok(())
    }

    async fn owner_of(&self, meter_id: &str) -> Result<Option<MeterOwner>, RepositoryError> {
        Ok(meter_registry_queries::meter_owner(&self.pool, meter_id).await?)
    }
}
