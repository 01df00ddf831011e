//! Low-latency telemetry store: latest value per meter plus a short-horizon,
//! timestamp-ordered log of raw snapshots.
//!
//! Reads never fail for a missing key; they return `None` or an empty
//! collection. Errors are reserved for the store itself being unavailable.

use std::collections::HashMap;

use meter_client::domain::{LatestReading, MeterDataSnapshot, MeterStatusSnapshot, TimeSeriesEntry};

pub mod memory;

pub use memory::InMemoryTelemetryStore;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("telemetry store unavailable: {0}")]
    Unavailable(String),
    #[error("telemetry store serialization error: {0}")]
    Serialization(String),
}

#[async_trait::async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Upsert the latest data reading. Refreshes the TTL of the whole latest-data
    /// collection, so any write keeps every meter's latest value alive.
    async fn store_latest_data(&self, reading: LatestReading<MeterDataSnapshot>) -> Result<(), StoreError>;

    /// Same TTL scope as [`TelemetryStore::store_latest_data`], on the status collection.
    async fn store_latest_status(&self, reading: LatestReading<MeterStatusSnapshot>) -> Result<(), StoreError>;

    async fn get_latest_data(&self, meter_id: &str) -> Result<Option<LatestReading<MeterDataSnapshot>>, StoreError>;

    async fn get_latest_status(&self, meter_id: &str)
        -> Result<Option<LatestReading<MeterStatusSnapshot>>, StoreError>;

    async fn get_all_latest_data(&self) -> Result<HashMap<String, LatestReading<MeterDataSnapshot>>, StoreError>;

    async fn get_all_latest_status(&self)
        -> Result<HashMap<String, LatestReading<MeterStatusSnapshot>>, StoreError>;

    /// Append to the meter's log and refresh that log's TTL. An entry with the same
    /// timestamp and kind replaces the earlier one.
    async fn store_time_series_snapshot(&self, entry: TimeSeriesEntry) -> Result<(), StoreError>;

    /// Entries with `from_ts <= timestamp <= to_ts`, ascending by timestamp.
    async fn get_time_series_snapshots(
        &self,
        meter_id: &str,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<Vec<TimeSeriesEntry>, StoreError>;

    /// Remove entries with `timestamp < before_ts`; returns how many were removed.
    async fn cleanup_old_time_series(&self, meter_id: &str, before_ts: i64) -> Result<usize, StoreError>;

    /// Meters that currently have a live time-series log.
    async fn time_series_meters(&self) -> Result<Vec<String>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
