//! Hourly rollups of the raw time-series log into the durable store.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use meter_client::domain::{
    datetime_from_millis, hour_start_ms, Channel, ChannelStats, HourlyAggregate, TimeSeriesEntry, HOUR_MS,
};

use crate::{
    clock::Clock,
    persistence::{AggregateRepository, RepositoryError},
    telemetry::{StoreError, TelemetryStore},
};

/// Longest history `latest_hours` will answer for.
pub const MAX_HISTORY_HOURS: u32 = 168;

#[derive(thiserror::Error, Debug)]
pub enum AggregationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Default)]
struct ChannelAcc {
    power_sum: f64,
    power_min: f64,
    power_max: f64,
    power_n: u32,
    voltage_sum: f64,
    voltage_n: u32,
    current_sum: f64,
    current_n: u32,
    energy_min: Option<f64>,
    energy_max: Option<f64>,
}

impl ChannelAcc {
    fn push(&mut self, power: Option<f64>, voltage: Option<f64>, current: Option<f64>, total_energy: Option<f64>) {
        if let Some(p) = power.filter(|p| p.is_finite()) {
            if self.power_n == 0 {
                self.power_min = p;
                self.power_max = p;
            } else {
                self.power_min = self.power_min.min(p);
                self.power_max = self.power_max.max(p);
            }
            self.power_sum += p;
            self.power_n += 1;
        }
        if let Some(v) = voltage.filter(|v| v.is_finite()) {
            self.voltage_sum += v;
            self.voltage_n += 1;
        }
        if let Some(c) = current.filter(|c| c.is_finite()) {
            self.current_sum += c;
            self.current_n += 1;
        }
        if let Some(e) = total_energy.filter(|e| e.is_finite()) {
            self.energy_min = Some(self.energy_min.map_or(e, |m| m.min(e)));
            self.energy_max = Some(self.energy_max.map_or(e, |m| m.max(e)));
        }
    }

    fn is_empty(&self) -> bool {
        self.power_n == 0 && self.energy_min.is_none()
    }

    fn finish(&self) -> ChannelStats {
        let avg = |sum: f64, n: u32| (n > 0).then(|| sum / f64::from(n));
        ChannelStats {
            power_avg: avg(self.power_sum, self.power_n).unwrap_or(0.0),
            power_min: self.power_min,
            power_max: self.power_max,
            voltage_avg: avg(self.voltage_sum, self.voltage_n),
            current_avg: avg(self.current_sum, self.current_n),
            energy_wh: match (self.energy_min, self.energy_max) {
                (Some(lo), Some(hi)) => hi - lo,
                _ => 0.0,
            },
            samples: self.power_n,
        }
    }
}

/// Fold one meter's raw entries into per-hour aggregates, ascending by hour.
///
/// Status entries are ignored. The result depends only on the set of entries,
/// not their order.
pub fn fold_hourly(meter_id: &str, entries: &[TimeSeriesEntry]) -> Vec<HourlyAggregate> {
    let mut hours: BTreeMap<i64, (i64, BTreeMap<Channel, ChannelAcc>)> = BTreeMap::new();

    for entry in entries {
        let Some(data) = entry.meter_data.as_ref() else {
            continue;
        };
        let (count, channels) = hours.entry(hour_start_ms(entry.timestamp)).or_default();
        *count += 1;

        for channel in Channel::ALL {
            if let Some(c) = data.channel(channel) {
                channels
                    .entry(channel)
                    .or_default()
                    .push(c.power, c.voltage, c.current, c.total_energy);
            }
        }
    }

    hours
        .into_iter()
        .map(|(hour, (sample_count, channels))| HourlyAggregate {
            meter_id: meter_id.to_string(),
            hour_start: datetime_from_millis(hour),
            sample_count,
            channels: channels
                .iter()
                .filter(|(_, acc)| !acc.is_empty())
                .map(|(ch, acc)| (*ch, acc.finish()))
                .collect(),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationReport {
    pub meters: usize,
    pub aggregates_upserted: u64,
    pub entries_trimmed: usize,
}

pub struct AggregationEngine {
    store: Arc<dyn TelemetryStore>,
    repo: Arc<dyn AggregateRepository>,
    clock: Arc<dyn Clock>,
    series_ttl: Duration,
    lookback_hours: u32,
}

impl AggregationEngine {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        repo: Arc<dyn AggregateRepository>,
        clock: Arc<dyn Clock>,
        series_ttl: Duration,
        lookback_hours: u32,
    ) -> Self {
        Self {
            store,
            repo,
            clock,
            series_ttl,
            lookback_hours: lookback_hours.max(1),
        }
    }

    /// Aggregate `[from_ms, to_ms)` for each meter and upsert the result.
    ///
    /// A meter whose log cannot be read is skipped with an error log; a failed
    /// upsert fails the whole window so the next run retries it.
    pub async fn aggregate_window(
        &self,
        meter_ids: &[String],
        from_ms: i64,
        to_ms: i64,
    ) -> Result<AggregationReport, AggregationError> {
        let mut rows = Vec::new();
        for meter_id in meter_ids {
            match self.store.get_time_series_snapshots(meter_id, from_ms, to_ms - 1).await {
                Ok(entries) => rows.extend(fold_hourly(meter_id, &entries)),
                Err(e) => {
                    tracing::error!(%meter_id, error = %e, "failed to read time series for aggregation");
                }
            }
        }

        let upserted = if rows.is_empty() { 0 } else { self.repo.upsert(&rows).await? };
        metrics::counter!("aggregates_upserted_total").increment(upserted);

        Ok(AggregationReport {
            meters: meter_ids.len(),
            aggregates_upserted: upserted,
            entries_trimmed: 0,
        })
    }

    /// Re-aggregate the last complete hours, then trim entries past the series TTL.
    ///
    /// Hours starting before the TTL cutoff may already be trimmed and are left
    /// as previously stored.
    pub async fn run_periodic(&self) -> Result<AggregationReport, AggregationError> {
        let now = self.clock.now_ms();
        let cutoff = now - self.series_ttl.as_millis() as i64;
        let to_ms = hour_start_ms(now);
        let from_ms = (to_ms - i64::from(self.lookback_hours) * HOUR_MS).max(hour_start_ms(cutoff + HOUR_MS - 1));

        let meters = self.store.time_series_meters().await?;
        let mut report = if from_ms < to_ms {
            self.aggregate_window(&meters, from_ms, to_ms).await?
        } else {
            tracing::warn!(lookback_hours = self.lookback_hours, "aggregation lookback exceeds series ttl, nothing to aggregate");
            AggregationReport {
                meters: meters.len(),
                ..Default::default()
            }
        };

        for meter_id in &meters {
            match self.store.cleanup_old_time_series(meter_id, cutoff).await {
                Ok(n) => report.entries_trimmed += n,
                Err(e) => tracing::warn!(%meter_id, error = %e, "failed to trim time series"),
            }
        }

        tracing::info!(
            meters = report.meters,
            upserted = report.aggregates_upserted,
            trimmed = report.entries_trimmed,
            "hourly aggregation complete"
        );
        Ok(report)
    }

    /// Stored aggregates for the last `hours` hours, oldest first. `hours` is
    /// clamped to `1..=168`.
    pub async fn latest_hours(&self, meter_id: &str, hours: u32) -> Result<Vec<HourlyAggregate>, AggregationError> {
        let hours = hours.clamp(1, MAX_HISTORY_HOURS);
        let since = hour_start_ms(self.clock.now_ms()) - i64::from(hours) * HOUR_MS;
        Ok(self.repo.history(meter_id, datetime_from_millis(since)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, persistence::InMemoryAggregateRepository, telemetry::InMemoryTelemetryStore};
    use meter_client::domain::{EnergyChannel, MeterDataSnapshot, MeterStatusSnapshot};

    const H0: i64 = 1_704_067_200_000; // 2024-01-01T00:00:00Z

    fn export_entry(ts: i64, power: f64, total: f64) -> TimeSeriesEntry {
        TimeSeriesEntry::data(
            "m-1",
            ts,
            MeterDataSnapshot {
                export: Some(EnergyChannel {
                    power: Some(power),
                    voltage: Some(230.0),
                    total_energy: Some(total),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
    }

    #[test]
    fn fold_groups_by_hour_and_computes_channel_stats() {
        let entries = vec![
            export_entry(H0 + 60_000, 100.0, 1000.0),
            export_entry(H0 + 120_000, 300.0, 1010.0),
            export_entry(H0 + HOUR_MS + 1, 50.0, 1200.0),
            TimeSeriesEntry::status("m-1", H0 + 5, MeterStatusSnapshot::default()),
        ];

        let out = fold_hourly("m-1", &entries);
        assert_eq!(out.len(), 2);

        let first = &out[0];
        assert_eq!(first.hour_start, datetime_from_millis(H0));
        assert_eq!(first.sample_count, 2);
        let export = first.channels[&Channel::Export];
        assert_eq!(export.power_avg, 200.0);
        assert_eq!(export.power_min, 100.0);
        assert_eq!(export.power_max, 300.0);
        assert_eq!(export.voltage_avg, Some(230.0));
        assert_eq!(export.current_avg, None);
        assert_eq!(export.energy_wh, 10.0);
        assert!(!first.channels.contains_key(&Channel::Import));

        assert_eq!(out[1].channels[&Channel::Export].energy_wh, 0.0);
    }

    #[test]
    fn fold_ignores_entry_order() {
        let a = export_entry(H0 + 10, 100.0, 1000.0);
        let b = export_entry(H0 + 20, 400.0, 1030.0);
        let c = export_entry(H0 + 30, 250.0, 1015.0);
        let forward = fold_hourly("m-1", &[a.clone(), b.clone(), c.clone()]);
        let shuffled = fold_hourly("m-1", &[c, a, b]);
        assert_eq!(forward, shuffled);
        assert_eq!(forward[0].channels[&Channel::Export].energy_wh, 30.0);
    }

    #[tokio::test]
    async fn periodic_run_aggregates_last_complete_hour_only_and_is_idempotent() {
        let clock = Arc::new(ManualClock::new(H0 + HOUR_MS + 10 * 60_000));
        let store = Arc::new(InMemoryTelemetryStore::new(
            clock.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(7200),
        ));
        let repo = Arc::new(InMemoryAggregateRepository::new());
        let engine = AggregationEngine::new(store.clone(), repo.clone(), clock.clone(), Duration::from_secs(7200), 1);

        store.store_time_series_snapshot(export_entry(H0 + 1_000, 100.0, 10.0)).await.unwrap();
        store.store_time_series_snapshot(export_entry(H0 + 2_000, 200.0, 20.0)).await.unwrap();
        // Current, incomplete hour.
        store
            .store_time_series_snapshot(export_entry(H0 + HOUR_MS + 1_000, 900.0, 90.0))
            .await
            .unwrap();

        let report = engine.run_periodic().await.unwrap();
        assert_eq!(report.aggregates_upserted, 1);
        let first = repo.all().await;

        engine.run_periodic().await.unwrap();
        let second = repo.all().await;
        assert_eq!(first, second);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].hour_start, datetime_from_millis(H0));
        assert_eq!(second[0].sample_count, 2);
    }

    #[tokio::test]
    async fn periodic_run_trims_entries_past_series_ttl() {
        let clock = Arc::new(ManualClock::new(H0));
        let store = Arc::new(InMemoryTelemetryStore::new(
            clock.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(7200),
        ));
        let repo = Arc::new(InMemoryAggregateRepository::new());
        let engine = AggregationEngine::new(store.clone(), repo, clock.clone(), Duration::from_secs(3600), 1);

        store.store_time_series_snapshot(export_entry(H0, 1.0, 1.0)).await.unwrap();
        clock.advance_ms(HOUR_MS + 30 * 60_000);
        store.store_time_series_snapshot(export_entry(H0 + HOUR_MS + 30 * 60_000, 2.0, 2.0)).await.unwrap();

        let report = engine.run_periodic().await.unwrap();
        assert_eq!(report.entries_trimmed, 1);
        assert_eq!(store.get_time_series_snapshots("m-1", 0, i64::MAX).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn trimmed_hours_are_not_re_aggregated() {
        // Lookback reaches past the series TTL on purpose.
        let clock = Arc::new(ManualClock::new(H0));
        let store = Arc::new(InMemoryTelemetryStore::new(
            clock.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(7200),
        ));
        let repo = Arc::new(InMemoryAggregateRepository::new());
        let engine = AggregationEngine::new(store.clone(), repo.clone(), clock.clone(), Duration::from_secs(7200), 2);

        let mut second_hour = None;
        for minute in 0..=160_i64 {
            if minute > 0 {
                clock.advance_ms(60_000);
            }
            store
                .store_time_series_snapshot(export_entry(H0 + minute * 60_000, 100.0, minute as f64))
                .await
                .unwrap();
            match minute {
                70 | 160 => {
                    engine.run_periodic().await.unwrap();
                }
                130 => {
                    engine.run_periodic().await.unwrap();
                    second_hour = repo.all().await.into_iter().find(|a| a.hour_start == datetime_from_millis(H0 + HOUR_MS));
                }
                _ => {}
            }
        }

        let rows = repo.all().await;
        let first = rows.iter().find(|a| a.hour_start == datetime_from_millis(H0)).unwrap();
        assert_eq!(first.sample_count, 60);
        assert_eq!(first.channels[&Channel::Export].energy_wh, 59.0);

        let second = rows
            .iter()
            .find(|a| a.hour_start == datetime_from_millis(H0 + HOUR_MS))
            .unwrap();
        assert_eq!(Some(second.clone()), second_hour);
        assert_eq!(second.sample_count, 60);
    }

    #[tokio::test]
    async fn latest_hours_is_clamped_to_one_week() {
        let clock = Arc::new(ManualClock::new(H0 + 200 * HOUR_MS));
        let store = Arc::new(InMemoryTelemetryStore::new(
            clock.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(7200),
        ));
        let repo = Arc::new(InMemoryAggregateRepository::new());
        let rows: Vec<HourlyAggregate> = (0..200)
            .map(|h| HourlyAggregate {
                meter_id: "m-1".to_string(),
                hour_start: datetime_from_millis(H0 + h * HOUR_MS),
                sample_count: 1,
                channels: BTreeMap::new(),
            })
            .collect();
        repo.upsert(&rows).await.unwrap();

        let engine = AggregationEngine::new(store, repo, clock, Duration::from_secs(7200), 1);
        assert_eq!(engine.latest_hours("m-1", 10_000).await.unwrap().len(), 168);
        assert_eq!(engine.latest_hours("m-1", 0).await.unwrap().len(), 1);
    }
}
