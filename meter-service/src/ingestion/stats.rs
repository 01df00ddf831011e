use std::{
    collections::HashSet,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::Mutex;

use super::TopicKind;

/// Message counts for one reporting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateSummary {
    pub total: u64,
    pub data: u64,
    pub status: u64,
    pub dropped: u64,
    pub distinct_meters: usize,
}

/// Rolling counters summarised and reset once per minute.
#[derive(Default)]
pub struct MessageRateStats {
    total: AtomicU64,
    data: AtomicU64,
    status: AtomicU64,
    dropped: AtomicU64,
    meters: Mutex<HashSet<String>>,
}

impl MessageRateStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_message(&self, kind: Option<TopicKind>) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match kind {
            Some(TopicKind::Data) => {
                self.data.fetch_add(1, Ordering::Relaxed);
            }
            Some(TopicKind::Status) => {
                self.status.fetch_add(1, Ordering::Relaxed);
            }
            None => {}
        }
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn record_meter(&self, meter_id: &str) {
        let mut meters = self.meters.lock().await;
        if !meters.contains(meter_id) {
            meters.insert(meter_id.to_string());
        }
    }

    /// Take the current window's counts and start a new window.
    pub async fn snapshot_and_reset(&self) -> RateSummary {
        let distinct_meters = {
            let mut meters = self.meters.lock().await;
            let n = meters.len();
            meters.clear();
            n
        };
        RateSummary {
            total: self.total.swap(0, Ordering::Relaxed),
            data: self.data.swap(0, Ordering::Relaxed),
            status: self.status.swap(0, Ordering::Relaxed),
            dropped: self.dropped.swap(0, Ordering::Relaxed),
            distinct_meters,
        }
    }

    pub async fn log_and_reset(&self) {
        let s = self.snapshot_and_reset().await;
        tracing::info!(
            total = s.total,
            data = s.data,
            status = s.status,
            dropped = s.dropped,
            meters = s.distinct_meters,
            "telemetry messages in the last minute"
        );
    }
}
