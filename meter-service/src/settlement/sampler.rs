use std::sync::Arc;

use futures::{stream, StreamExt};

use super::{AutoShutdownMonitor, PowerSample, PowerSampleBuffer, SettlementEstimator, ShutdownDecision};
use crate::{clock::Clock, telemetry::TelemetryStore};

/// Concurrent safety checks per tick.
const SAFETY_CONCURRENCY: usize = 8;

/// The per-second loop body: sample every meter's net power, then run the
/// auto-shutdown check for meters that are importing.
pub struct PowerSampler {
    store: Arc<dyn TelemetryStore>,
    buffer: Arc<PowerSampleBuffer>,
    clock: Arc<dyn Clock>,
    estimator: Arc<SettlementEstimator>,
    monitor: Option<Arc<AutoShutdownMonitor>>,
}

impl PowerSampler {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        buffer: Arc<PowerSampleBuffer>,
        clock: Arc<dyn Clock>,
        estimator: Arc<SettlementEstimator>,
        monitor: Option<Arc<AutoShutdownMonitor>>,
    ) -> Self {
        Self {
            store,
            buffer,
            clock,
            estimator,
            monitor,
        }
    }

    /// Returns the meters sampled this tick.
    pub async fn sample(&self) -> Vec<String> {
        let latest = match self.store.get_all_latest_data().await {
            Ok(latest) => latest,
            Err(e) => {
                tracing::warn!(error = %e, "power sampling skipped, telemetry store unavailable");
                return Vec::new();
            }
        };

        let now = self.clock.now_ms();
        let mut sampled = Vec::with_capacity(latest.len());
        for (meter_id, reading) in latest {
            let Some(watts) = reading.payload.net_power_w() else {
                continue;
            };
            self.buffer
                .push(
                    &meter_id,
                    PowerSample {
                        timestamp: now,
                        power_kw: watts / 1000.0,
                    },
                )
                .await;
            sampled.push(meter_id);
        }
        sampled
    }

    pub async fn tick(&self) {
        let meters = self.sample().await;

        let Some(monitor) = self.monitor.as_ref() else {
            return;
        };

        stream::iter(meters)
            .for_each_concurrent(SAFETY_CONCURRENCY, |meter_id| async move {
                let estimate = match self.estimator.estimate(&meter_id).await {
                    Ok(Some(estimate)) => estimate,
                    Ok(None) => return,
                    Err(e) => {
                        tracing::warn!(%meter_id, error = %e, "estimate failed in safety check");
                        return;
                    }
                };
                match monitor.check(&estimate).await {
                    Ok(ShutdownDecision::ShutDown { .. }) | Ok(ShutdownDecision::NotImporting) => {}
                    Ok(decision) => tracing::trace!(%meter_id, ?decision, "safety check"),
                    Err(e) => tracing::warn!(%meter_id, error = %e, "safety check failed"),
                }
            })
            .await;
    }
}
