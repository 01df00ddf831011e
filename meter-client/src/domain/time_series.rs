use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{MeterDataSnapshot, MeterStatusSnapshot};

/// Which topic an entry came from. Used to deduplicate repeated deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Data,
    Status,
}

/// A raw snapshot in a meter's short-horizon log. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesEntry {
    pub meter_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub datetime: OffsetDateTime,
    /// Epoch milliseconds; the ordering key within a meter's log.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter_data: Option<MeterDataSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_data: Option<MeterStatusSnapshot>,
}

impl TimeSeriesEntry {
    pub fn data(meter_id: impl Into<String>, timestamp: i64, data: MeterDataSnapshot) -> Self {
        Self {
            meter_id: meter_id.into(),
            datetime: datetime_from_millis(timestamp),
            timestamp,
            meter_data: Some(data),
            status_data: None,
        }
    }

    pub fn status(meter_id: impl Into<String>, timestamp: i64, status: MeterStatusSnapshot) -> Self {
        Self {
            meter_id: meter_id.into(),
            datetime: datetime_from_millis(timestamp),
            timestamp,
            meter_data: None,
            status_data: Some(status),
        }
    }

    pub fn kind(&self) -> EntryKind {
        if self.meter_data.is_some() {
            EntryKind::Data
        } else {
            EntryKind::Status
        }
    }
}

/// The latest payload kept per meter, stamped with the time it was observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestReading<T> {
    pub meter_id: String,
    /// Epoch milliseconds of the reading (device clock when present, else receipt time).
    pub timestamp: i64,
    /// Epoch milliseconds at which the service received the message.
    pub received_at: i64,
    pub payload: T,
}

/// Convert epoch milliseconds to a UTC datetime, saturating on out-of-range input.
pub fn datetime_from_millis(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub fn millis_from_datetime(dt: OffsetDateTime) -> i64 {
    (dt.unix_timestamp_nanos() / 1_000_000) as i64
}
