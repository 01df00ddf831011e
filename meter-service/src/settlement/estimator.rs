use std::{sync::Arc, time::Duration};

use meter_client::domain::datetime_from_millis;
use serde::Serialize;
use time::OffsetDateTime;

use super::{ledger_call, PowerSampleBuffer, SettlementError};
use crate::{
    clock::Clock,
    ledger::{signed_etk_amount, LedgerClient},
    telemetry::TelemetryStore,
};

const MS_PER_HOUR: f64 = 3_600_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnergyFlow {
    Exporting,
    Importing,
    Idle,
}

/// Direction of grid flow for an average power, with a symmetric dead-band.
pub fn classify_flow(avg_kw: f64, deadband_w: f64) -> EnergyFlow {
    let watts = avg_kw * 1000.0;
    if watts > deadband_w {
        EnergyFlow::Exporting
    } else if watts < -deadband_w {
        EnergyFlow::Importing
    } else {
        EnergyFlow::Idle
    }
}

/// A fixed-length settlement window aligned to the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementPeriod {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl SettlementPeriod {
    /// The period containing `now_ms`: the current minute floored to the interval.
    pub fn containing(now_ms: i64, interval: Duration) -> Self {
        let len = (interval.as_millis() as i64).max(60_000);
        let minute = now_ms - now_ms.rem_euclid(60_000);
        let start = minute - minute.rem_euclid(len);
        Self {
            start_ms: start,
            end_ms: start + len,
        }
    }

    pub fn remaining_ms(&self, now_ms: i64) -> i64 {
        (self.end_ms - now_ms).max(0)
    }

    pub fn progress_percent(&self, now_ms: i64) -> f64 {
        let len = (self.end_ms - self.start_ms) as f64;
        if len <= 0.0 {
            return 100.0;
        }
        ((now_ms - self.start_ms) as f64 / len * 100.0).clamp(0.0, 100.0)
    }
}

/// End-of-period net energy if the average power holds for the rest of the period.
pub fn project_net_wh(actual_net_wh: f64, avg_kw: f64, remaining_ms: i64) -> f64 {
    actual_net_wh + avg_kw * 1000.0 * (remaining_ms.max(0) as f64 / MS_PER_HOUR)
}

/// Advisory view of where the current period is heading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettlementEstimate {
    pub meter_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub time_remaining_secs: i64,
    pub progress_percentage: f64,
    pub actual_export_wh: f64,
    pub actual_import_wh: f64,
    pub actual_net_wh: f64,
    pub average_power_kw: f64,
    pub samples: usize,
    pub projected_net_wh: f64,
    pub projected_etk_amount: f64,
    pub status: EnergyFlow,
}

pub struct SettlementEstimator {
    store: Arc<dyn TelemetryStore>,
    buffer: Arc<PowerSampleBuffer>,
    ledger: Arc<dyn LedgerClient>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    deadband_w: f64,
    ledger_timeout: Duration,
}

impl SettlementEstimator {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        buffer: Arc<PowerSampleBuffer>,
        ledger: Arc<dyn LedgerClient>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        deadband_w: f64,
        ledger_timeout: Duration,
    ) -> Self {
        Self {
            store,
            buffer,
            ledger,
            clock,
            interval,
            deadband_w,
            ledger_timeout,
        }
    }

    /// `None` when the meter has no live data reading.
    pub async fn estimate(&self, meter_id: &str) -> Result<Option<SettlementEstimate>, SettlementError> {
        let Some(latest) = self.store.get_latest_data(meter_id).await? else {
            return Ok(None);
        };

        let now = self.clock.now_ms();
        let period = SettlementPeriod::containing(now, self.interval);
        let remaining = period.remaining_ms(now);

        let (export, import) = latest.payload.settlement_counters();
        let export = export.filter(|v| v.is_finite()).unwrap_or(0.0);
        let import = import.filter(|v| v.is_finite()).unwrap_or(0.0);
        let actual_net = export - import;

        let avg_kw = self.buffer.average_kw(meter_id).await.unwrap_or(0.0);
        let projected = project_net_wh(actual_net, avg_kw, remaining);
        let projected_etk = ledger_call(self.ledger_timeout, signed_etk_amount(self.ledger.as_ref(), projected)).await?;

        Ok(Some(SettlementEstimate {
            meter_id: meter_id.to_string(),
            period_start: datetime_from_millis(period.start_ms),
            period_end: datetime_from_millis(period.end_ms),
            time_remaining_secs: remaining / 1000,
            progress_percentage: period.progress_percent(now),
            actual_export_wh: export,
            actual_import_wh: import,
            actual_net_wh: actual_net,
            average_power_kw: avg_kw,
            samples: self.buffer.len(meter_id).await,
            projected_net_wh: projected,
            projected_etk_amount: projected_etk,
            status: classify_flow(avg_kw, self.deadband_w),
        }))
    }
}
