//! Periodic and manual settlement of accumulated export/import energy against
//! the ledger, plus the per-second sampling loop that feeds the estimator and
//! the auto-shutdown monitor.

use std::{future::Future, time::Duration};

use crate::{
    commands::CommandError,
    ledger::LedgerError,
    persistence::RepositoryError,
    telemetry::StoreError,
};

pub mod estimator;
pub mod orchestrator;
pub mod power_buffer;
pub mod safety;
pub mod sampler;

pub use estimator::{EnergyFlow, SettlementEstimate, SettlementEstimator, SettlementPeriod};
pub use orchestrator::{CycleReport, ReconcileReport, SettlementOrchestrator, SettlementOutcome};
pub use power_buffer::{PowerSample, PowerSampleBuffer};
pub use safety::{AutoShutdownMonitor, ShutdownDecision};
pub use sampler::PowerSampler;

#[derive(thiserror::Error, Debug)]
pub enum SettlementError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("meter {0} is not registered")]
    UnknownMeter(String),
    #[error("meter {meter_id} is not owned by the caller")]
    Forbidden { meter_id: String },
    #[error("settlement {0} not found")]
    NotFound(String),
    #[error("settlement {0} has no ledger transaction to confirm")]
    NotSubmitted(String),
    #[error("tx hash does not match the one submitted for settlement {settlement_id}")]
    TxHashMismatch { settlement_id: String },
}

/// Bound a ledger call; expiry becomes [`LedgerError::Timeout`].
pub async fn ledger_call<T, F>(limit: Duration, fut: F) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::Timeout(limit)),
    }
}
