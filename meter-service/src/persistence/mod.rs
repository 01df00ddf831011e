//! Durable store seams: hourly aggregates, settlement records and the external
//! meter registry.

use meter_client::domain::{
    HourlyAggregate, MeterOwner, NewSettlement, SettlementFinalization, SettlementRecord,
    SettlementStatus,
};
use time::OffsetDateTime;

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryAggregateRepository, InMemoryMeterRegistry, InMemorySettlementRepository};
pub use postgres::{PgAggregateRepository, PgMeterRegistry, PgSettlementRepository};

#[derive(thiserror::Error, Debug)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] anyhow::Error),
    #[error("settlement {0} not found")]
    NotFound(String),
    #[error("settlement {settlement_id} is already {status}")]
    AlreadyFinal {
        settlement_id: String,
        status: SettlementStatus,
    },
}

#[async_trait::async_trait]
pub trait AggregateRepository: Send + Sync {
    /// Insert or replace by `(meter_id, hour_start)`.
    async fn upsert(&self, rows: &[HourlyAggregate]) -> Result<u64, RepositoryError>;

    async fn history(&self, meter_id: &str, since: OffsetDateTime) -> Result<Vec<HourlyAggregate>, RepositoryError>;

    async fn older_than(&self, before: OffsetDateTime, limit: i64) -> Result<Vec<HourlyAggregate>, RepositoryError>;

    async fn count_older_than(&self, before: OffsetDateTime) -> Result<i64, RepositoryError>;

    async fn delete(&self, keys: &[(String, OffsetDateTime)]) -> Result<u64, RepositoryError>;
}

/// Query over settlement history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettlementFilter {
    pub meter_id: Option<String>,
    pub owner_id: Option<String>,
    pub limit: i64,
}

#[async_trait::async_trait]
pub trait SettlementRepository: Send + Sync {
    async fn create_pending(&self, new: NewSettlement) -> Result<SettlementRecord, RepositoryError>;

    /// Attach the ledger transaction hash to a record that is still pending.
    async fn attach_tx_hash(&self, settlement_id: &str, tx_hash: &str) -> Result<SettlementRecord, RepositoryError>;

    /// Move a pending record to a terminal state. Terminal records are rejected
    /// with [`RepositoryError::AlreadyFinal`].
    async fn finalize(
        &self,
        settlement_id: &str,
        fin: SettlementFinalization,
    ) -> Result<SettlementRecord, RepositoryError>;

    async fn get(&self, settlement_id: &str) -> Result<Option<SettlementRecord>, RepositoryError>;

    async fn history(&self, filter: &SettlementFilter) -> Result<Vec<SettlementRecord>, RepositoryError>;

    /// Newest record for the meter that is pending or succeeded.
    async fn latest_not_failed(&self, meter_id: &str) -> Result<Option<SettlementRecord>, RepositoryError>;

    async fn stale_pending(&self, before: OffsetDateTime) -> Result<Vec<SettlementRecord>, RepositoryError>;

    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

/// The external registry of meters and their owners.
#[async_trait::async_trait]
pub trait MeterRegistry: Send + Sync {
    async fn touch_last_seen(&self, meter_id: &str, at: OffsetDateTime) -> Result<(), RepositoryError>;

    async fn owner_of(&self, meter_id: &str) -> Result<Option<MeterOwner>, RepositoryError>;
}
