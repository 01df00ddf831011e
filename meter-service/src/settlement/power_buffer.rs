use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PowerSample {
    /// Epoch milliseconds.
    pub timestamp: i64,
    /// Net grid power, positive when exporting.
    pub power_kw: f64,
}

/// Rolling window of net-power samples per meter.
///
/// Each meter's samples are kept in timestamp order; anything older than the
/// window relative to the newest sample is dropped on insert.
pub struct PowerSampleBuffer {
    window_ms: i64,
    samples: RwLock<HashMap<String, VecDeque<PowerSample>>>,
}

impl PowerSampleBuffer {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: window.as_millis() as i64,
            samples: RwLock::new(HashMap::new()),
        }
    }

    pub async fn push(&self, meter_id: &str, sample: PowerSample) {
        if !sample.power_kw.is_finite() {
            return;
        }

        let mut map = self.samples.write().await;
        let buf = map.entry(meter_id.to_string()).or_default();

        match buf.back() {
            Some(last) if last.timestamp > sample.timestamp => {
                let at = buf.partition_point(|s| s.timestamp <= sample.timestamp);
                buf.insert(at, sample);
            }
            _ => buf.push_back(sample),
        }

        if let Some(newest) = buf.back().map(|s| s.timestamp) {
            let cutoff = newest - self.window_ms;
            while buf.front().is_some_and(|s| s.timestamp < cutoff) {
                buf.pop_front();
            }
        }
    }

    /// Mean power over the window, `None` without samples.
    pub async fn average_kw(&self, meter_id: &str) -> Option<f64> {
        let map = self.samples.read().await;
        let buf = map.get(meter_id).filter(|b| !b.is_empty())?;
        Some(buf.iter().map(|s| s.power_kw).sum::<f64>() / buf.len() as f64)
    }

    pub async fn len(&self, meter_id: &str) -> usize {
        self.samples.read().await.get(meter_id).map_or(0, VecDeque::len)
    }

    pub async fn samples(&self, meter_id: &str) -> Vec<PowerSample> {
        self.samples
            .read()
            .await
            .get(meter_id)
            .map(|b| b.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Forget a meter's window, e.g. after its counters were reset.
    pub async fn clear(&self, meter_id: &str) {
        self.samples.write().await.remove(meter_id);
    }
}
