//! Process-local [`TelemetryStore`].
//!
//! Deployment constraint: run one service instance per meter population, and
//! expect a restart to drop every latest reading and the whole series log.
//! Hours not yet folded into hourly aggregates at that point are lost, and
//! settlement waits for the next reading of each meter.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use meter_client::domain::{
    EntryKind, LatestReading, MeterDataSnapshot, MeterStatusSnapshot, TimeSeriesEntry,
};
use tokio::sync::RwLock;

use super::{StoreError, TelemetryStore};
use crate::clock::Clock;

/// A keyed collection sharing one expiry, like a hash with a TTL on the key.
struct Collection<T> {
    entries: HashMap<String, LatestReading<T>>,
    expires_at_ms: i64,
}

impl<T> Default for Collection<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            expires_at_ms: i64::MIN,
        }
    }
}

impl<T: Clone> Collection<T> {
    fn live(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at_ms
    }

    fn upsert(&mut self, reading: LatestReading<T>, now_ms: i64, ttl_ms: i64) {
        if !self.live(now_ms) {
            self.entries.clear();
        }
        self.entries.insert(reading.meter_id.clone(), reading);
        self.expires_at_ms = now_ms.saturating_add(ttl_ms);
    }

    fn get(&self, meter_id: &str, now_ms: i64) -> Option<LatestReading<T>> {
        if !self.live(now_ms) {
            return None;
        }
        self.entries.get(meter_id).cloned()
    }

    fn all(&self, now_ms: i64) -> HashMap<String, LatestReading<T>> {
        if !self.live(now_ms) {
            return HashMap::new();
        }
        self.entries.clone()
    }
}

/// Score-ordered log for one meter. Keyed by `(timestamp, kind)` so a repeated
/// delivery of the same message collapses onto one entry.
#[derive(Default)]
struct Series {
    entries: BTreeMap<(i64, EntryKind), TimeSeriesEntry>,
    expires_at_ms: i64,
}

#[derive(Default)]
struct Inner {
    latest_data: Collection<MeterDataSnapshot>,
    latest_status: Collection<MeterStatusSnapshot>,
    series: HashMap<String, Series>,
}

/// In-process [`TelemetryStore`] with lazy TTL expiry.
pub struct InMemoryTelemetryStore {
    inner: RwLock<Inner>,
    clock: Arc<dyn Clock>,
    latest_ttl_ms: i64,
    series_ttl_ms: i64,
}

impl InMemoryTelemetryStore {
    pub fn new(clock: Arc<dyn Clock>, latest_ttl: Duration, series_ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            clock,
            latest_ttl_ms: latest_ttl.as_millis() as i64,
            series_ttl_ms: series_ttl.as_millis() as i64,
        }
    }

    /// Drop expired collections and logs. Reads already hide them; this releases memory.
    pub async fn evict_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut inner = self.inner.write().await;

        if !inner.latest_data.live(now) {
            inner.latest_data.entries.clear();
        }
        if !inner.latest_status.live(now) {
            inner.latest_status.entries.clear();
        }

        let before = inner.series.len();
        inner.series.retain(|_, s| now < s.expires_at_ms);
        before - inner.series.len()
    }
}

#[async_trait::async_trait]
impl TelemetryStore for InMemoryTelemetryStore {
    async fn store_latest_data(&self, reading: LatestReading<MeterDataSnapshot>) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.write().await;
        inner.latest_data.upsert(reading, now, self.latest_ttl_ms);
        Ok(())
    }

    async fn store_latest_status(&self, reading: LatestReading<MeterStatusSnapshot>) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.write().await;
        inner.latest_status.upsert(reading, now, self.latest_ttl_ms);
        Ok(())
    }

    async fn get_latest_data(&self, meter_id: &str) -> Result<Option<LatestReading<MeterDataSnapshot>>, StoreError> {
        let now = self.clock.now_ms();
        Ok(self.inner.read().await.latest_data.get(meter_id, now))
    }

    async fn get_latest_status(
        &self,
        meter_id: &str,
    ) -> Result<Option<LatestReading<MeterStatusSnapshot>>, StoreError> {
        let now = self.clock.now_ms();
        Ok(self.inner.read().await.latest_status.get(meter_id, now))
    }

    async fn get_all_latest_data(&self) -> Result<HashMap<String, LatestReading<MeterDataSnapshot>>, StoreError> {
        let now = self.clock.now_ms();
        Ok(self.inner.read().await.latest_data.all(now))
    }

    async fn get_all_latest_status(
        &self,
    ) -> Result<HashMap<String, LatestReading<MeterStatusSnapshot>>, StoreError> {
        let now = self.clock.now_ms();
        Ok(self.inner.read().await.latest_status.all(now))
    }

    async fn store_time_series_snapshot(&self, entry: TimeSeriesEntry) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.write().await;
        let series = inner.series.entry(entry.meter_id.clone()).or_default();
        if now >= series.expires_at_ms {
            series.entries.clear();
        }
        series.entries.insert((entry.timestamp, entry.kind()), entry);
        series.expires_at_ms = now.saturating_add(self.series_ttl_ms);
        Ok(())
    }

    async fn get_time_series_snapshots(
        &self,
        meter_id: &str,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<Vec<TimeSeriesEntry>, StoreError> {
        if from_ts > to_ts {
            return Ok(Vec::new());
        }

        let now = self.clock.now_ms();
        let inner = self.inner.read().await;
        let Some(series) = inner.series.get(meter_id) else {
            return Ok(Vec::new());
        };
        if now >= series.expires_at_ms {
            return Ok(Vec::new());
        }

        Ok(series
            .entries
            .range((from_ts, EntryKind::Data)..=(to_ts, EntryKind::Status))
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn cleanup_old_time_series(&self, meter_id: &str, before_ts: i64) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(series) = inner.series.get_mut(meter_id) else {
            return Ok(0);
        };

        let kept = series.entries.split_off(&(before_ts, EntryKind::Data));
        let removed = series.entries.len();
        series.entries = kept;

        if series.entries.is_empty() {
            inner.series.remove(meter_id);
        }
        Ok(removed)
    }

    async fn time_series_meters(&self) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now_ms();
        let inner = self.inner.read().await;
        let mut ids: Vec<String> = inner
            .series
            .iter()
            .filter(|(_, s)| now < s.expires_at_ms)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
