use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Settlement lifecycle. `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Pending,
    Success,
    Failed,
}

impl SettlementStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SettlementStatus::Pending => "PENDING",
            SettlementStatus::Success => "SUCCESS",
            SettlementStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, SettlementStatus::Pending)
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettlementStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(SettlementStatus::Pending),
            "SUCCESS" => Ok(SettlementStatus::Success),
            "FAILED" => Ok(SettlementStatus::Failed),
            other => Err(ParseEnumError {
                kind: "settlement status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementTrigger {
    Periodic,
    Manual,
}

impl SettlementTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            SettlementTrigger::Periodic => "PERIODIC",
            SettlementTrigger::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for SettlementTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettlementTrigger {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PERIODIC" => Ok(SettlementTrigger::Periodic),
            "MANUAL" => Ok(SettlementTrigger::Manual),
            other => Err(ParseEnumError {
                kind: "settlement trigger",
                value: other.to_string(),
            }),
        }
    }
}

/// Audit record of one settlement attempt.
///
/// Once `status` is terminal the record is never updated again; corrections
/// are new records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub id: i64,
    pub settlement_id: String,
    pub meter_id: String,
    pub owner_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end_time: OffsetDateTime,
    pub raw_export_wh: f64,
    pub raw_import_wh: f64,
    /// `raw_export_wh - raw_import_wh`; positive means net export (mint).
    pub net_wh_from_grid: f64,
    /// Token amount, same sign as `net_wh_from_grid`.
    pub etk_amount_credited: f64,
    pub status: SettlementStatus,
    pub settlement_trigger: SettlementTrigger,
    pub blockchain_tx_hash: Option<String>,
    pub failure_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at_backend: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub confirmed_at_on_chain: Option<OffsetDateTime>,
}

impl SettlementRecord {
    /// Pending and already handed to the ledger, awaiting confirmation.
    pub fn is_submitted(&self) -> bool {
        self.status == SettlementStatus::Pending && self.blockchain_tx_hash.is_some()
    }
}

/// Values for a record about to be created in `PENDING` state.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSettlement {
    pub meter_id: String,
    pub owner_id: String,
    pub period_start_time: OffsetDateTime,
    pub period_end_time: OffsetDateTime,
    pub raw_export_wh: f64,
    pub raw_import_wh: f64,
    pub net_wh_from_grid: f64,
    pub etk_amount_credited: f64,
    pub settlement_trigger: SettlementTrigger,
    pub created_at_backend: OffsetDateTime,
}

/// Terminal transition applied to a pending record.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementFinalization {
    pub status: SettlementStatus,
    pub blockchain_tx_hash: Option<String>,
    pub etk_amount_credited: Option<f64>,
    pub failure_reason: Option<String>,
    pub confirmed_at_on_chain: OffsetDateTime,
}

/// `settlement_<recordId>_<epochMillis>`
pub fn settlement_id(record_id: i64, created_at: OffsetDateTime) -> String {
    let millis = created_at.unix_timestamp_nanos() / 1_000_000;
    format!("settlement_{record_id}_{millis}")
}
