//! Read side consumed by the HTTP API and the tools.

use std::sync::Arc;

use meter_client::domain::{HourlyAggregate, SettlementRecord};
use serde::Serialize;

use crate::{
    aggregation::{AggregationEngine, AggregationError},
    archival::{ArchivalJob, ArchiveError, ArchiveStats},
    persistence::{RepositoryError, SettlementFilter, SettlementRepository},
    settlement::{SettlementError, SettlementEstimate, SettlementEstimator},
    telemetry::TelemetryStore,
};

pub const DEFAULT_HISTORY_LIMIT: i64 = 50;
pub const MAX_HISTORY_LIMIT: i64 = 500;

#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error(transparent)]
    Settlement(#[from] SettlementError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("archival is not enabled")]
    ArchivalDisabled,
}

/// Whose settlements a history query may see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryScope {
    Owner(String),
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub telemetry_store: bool,
    pub database: bool,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.telemetry_store && self.database
    }
}

pub struct QueryService {
    store: Arc<dyn TelemetryStore>,
    settlements: Arc<dyn SettlementRepository>,
    aggregation: Arc<AggregationEngine>,
    estimator: Arc<SettlementEstimator>,
    archival: Option<Arc<ArchivalJob>>,
}

impl QueryService {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        settlements: Arc<dyn SettlementRepository>,
        aggregation: Arc<AggregationEngine>,
        estimator: Arc<SettlementEstimator>,
        archival: Option<Arc<ArchivalJob>>,
    ) -> Self {
        Self {
            store,
            settlements,
            aggregation,
            estimator,
            archival,
        }
    }

    /// Newest first; `limit` defaults to 50 and is capped at 500.
    pub async fn settlement_history(
        &self,
        scope: HistoryScope,
        meter_id: Option<String>,
        limit: Option<i64>,
    ) -> Result<Vec<SettlementRecord>, QueryError> {
        let filter = SettlementFilter {
            meter_id,
            owner_id: match scope {
                HistoryScope::Owner(id) => Some(id),
                HistoryScope::All => None,
            },
            limit: limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT),
        };
        Ok(self.settlements.history(&filter).await?)
    }

    pub async fn settlement(&self, settlement_id: &str) -> Result<Option<SettlementRecord>, QueryError> {
        Ok(self.settlements.get(settlement_id).await?)
    }

    pub async fn settlement_estimate(&self, meter_id: &str) -> Result<Option<SettlementEstimate>, QueryError> {
        Ok(self.estimator.estimate(meter_id).await?)
    }

    pub async fn hourly_history(&self, meter_id: &str, hours: u32) -> Result<Vec<HourlyAggregate>, QueryError> {
        Ok(self.aggregation.latest_hours(meter_id, hours).await?)
    }

    pub async fn archive_stats(&self) -> Result<ArchiveStats, QueryError> {
        let job = self.archival.as_ref().ok_or(QueryError::ArchivalDisabled)?;
        Ok(job.stats().await?)
    }

    pub async fn health(&self) -> HealthReport {
        let telemetry_store = match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "telemetry store health check failed");
                false
            }
        };
        let database = match self.settlements.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "database health check failed");
                false
            }
        };
        HealthReport {
            telemetry_store,
            database,
        }
    }
}
