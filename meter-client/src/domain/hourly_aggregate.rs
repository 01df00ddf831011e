use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::Channel;

pub const HOUR_MS: i64 = 3_600_000;

/// Summary of one channel over one hour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub power_avg: f64,
    pub power_min: f64,
    pub power_max: f64,
    pub voltage_avg: Option<f64>,
    pub current_avg: Option<f64>,
    /// Delta of the channel's cumulative `total_energy` counter within the hour (Wh).
    pub energy_wh: f64,
    pub samples: u32,
}

/// Hourly rollup for one meter. At most one row exists per `(meter_id, hour_start)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyAggregate {
    pub meter_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub hour_start: OffsetDateTime,
    pub sample_count: i64,
    pub channels: BTreeMap<Channel, ChannelStats>,
}

/// Floor epoch milliseconds to the start of the hour.
pub fn hour_start_ms(ts_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(HOUR_MS)
}
