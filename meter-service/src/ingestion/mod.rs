//! Broker → telemetry store adapter.
//!
//! Each message is handled on its own: parse, attribute to a meter, write the
//! latest-value slot and the time-series log, touch the registry. Nothing is
//! retried here; telemetry is a continuous stream and the next message from
//! the device repairs any state a failed write left behind.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use meter_client::domain::{
    datetime_from_millis, device_timestamp_ms, LatestReading, MeterDataSnapshot, MeterStatusSnapshot,
    TimeSeriesEntry,
};
use serde_json::{Map, Value};

use crate::{
    clock::Clock,
    persistence::MeterRegistry,
    pipeline::{BrokerMessage, Envelope, PipelineError, Sink},
    telemetry::{StoreError, TelemetryStore},
};

pub mod stats;

pub use stats::{MessageRateStats, RateSummary};

/// Device clocks further ahead than this are ignored in favour of receipt time.
const MAX_CLOCK_SKEW_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Data,
    Status,
}

/// Classify `<namespace>/meters/data`, `<namespace>/meters/status` and the
/// per-meter forms `<namespace>/meters/<id>/data|status`.
pub fn classify_topic(namespace: &str, topic: &str) -> Option<TopicKind> {
    let rest = topic.strip_prefix(namespace)?.strip_prefix("/meters/")?;
    let last = rest.rsplit('/').next()?;
    match last {
        "data" => Some(TopicKind::Data),
        "status" => Some(TopicKind::Status),
        _ => None,
    }
}

/// Result of attributing a message to a meter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeterIdResolution {
    Resolved(String),
    Unresolved,
}

/// Payload `meter_id`/`meterId` first, then the topic segment after `meters`.
pub fn resolve_meter_id(payload: &Map<String, Value>, topic: &str) -> MeterIdResolution {
    for key in ["meter_id", "meterId"] {
        if let Some(id) = payload.get(key).and_then(Value::as_str).map(str::trim) {
            if !id.is_empty() {
                return MeterIdResolution::Resolved(id.to_string());
            }
        }
    }

    let mut segments = topic.split('/');
    if segments.any(|s| s == "meters") {
        if let Some(seg) = segments.next() {
            let is_leaf = matches!(seg, "data" | "status" | "command");
            if !seg.is_empty() && !is_leaf {
                return MeterIdResolution::Resolved(seg.to_string());
            }
        }
    }

    MeterIdResolution::Unresolved
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UnknownTopic,
    Malformed,
    NotAnObject,
    UnresolvedMeter,
    InvalidPayload,
    StoreFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored { meter_id: String, kind: TopicKind },
    Dropped(DropReason),
}

pub struct IngestionAdapter {
    namespace: String,
    fallback_meter_id: Option<String>,
    store: Arc<dyn TelemetryStore>,
    registry: Arc<dyn MeterRegistry>,
    clock: Arc<dyn Clock>,
    stats: Arc<MessageRateStats>,
}

impl IngestionAdapter {
    pub fn new(
        namespace: impl Into<String>,
        fallback_meter_id: Option<String>,
        store: Arc<dyn TelemetryStore>,
        registry: Arc<dyn MeterRegistry>,
        clock: Arc<dyn Clock>,
        stats: Arc<MessageRateStats>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            fallback_meter_id,
            store,
            registry,
            clock,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<MessageRateStats> {
        &self.stats
    }

    fn drop_message(&self, reason: DropReason) -> IngestOutcome {
        self.stats.record_dropped();
        metrics::counter!("ingest_messages_dropped_total", "reason" => format!("{reason:?}")).increment(1);
        IngestOutcome::Dropped(reason)
    }

    pub async fn handle_message(&self, topic: &str, raw: &[u8]) -> IngestOutcome {
        let kind = classify_topic(&self.namespace, topic);
        self.stats.record_message(kind);
        let Some(kind) = kind else {
            tracing::debug!(topic, "ignoring message on unrelated topic");
            return self.drop_message(DropReason::UnknownTopic);
        };

        let value: Value = match serde_json::from_slice(raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(topic, error = %e, "dropping malformed telemetry message");
                return self.drop_message(DropReason::Malformed);
            }
        };
        let Some(obj) = value.as_object() else {
            tracing::warn!(topic, "dropping telemetry message that is not a JSON object");
            return self.drop_message(DropReason::NotAnObject);
        };

        let meter_id = match (resolve_meter_id(obj, topic), &self.fallback_meter_id) {
            (MeterIdResolution::Resolved(id), _) => id,
            (MeterIdResolution::Unresolved, Some(fallback)) => {
                tracing::warn!(topic, meter_id = %fallback, "no meter id in message, using configured fallback");
                fallback.clone()
            }
            (MeterIdResolution::Unresolved, None) => {
                tracing::warn!(topic, "dropping telemetry message without a meter id");
                return self.drop_message(DropReason::UnresolvedMeter);
            }
        };
        self.stats.record_meter(&meter_id).await;

        let now = self.clock.now_ms();
        let result = match kind {
            TopicKind::Data => match serde_json::from_value::<MeterDataSnapshot>(value) {
                Ok(data) => self.store_data(&meter_id, data, now).await,
                Err(e) => {
                    tracing::warn!(%meter_id, error = %e, "dropping invalid meter data payload");
                    return self.drop_message(DropReason::InvalidPayload);
                }
            },
            TopicKind::Status => match serde_json::from_value::<MeterStatusSnapshot>(value) {
                Ok(status) => self.store_status(&meter_id, status, now).await,
                Err(e) => {
                    tracing::warn!(%meter_id, error = %e, "dropping invalid meter status payload");
                    return self.drop_message(DropReason::InvalidPayload);
                }
            },
        };

        if let Err(e) = result {
            tracing::error!(%meter_id, error = %e, "telemetry store write failed, message dropped");
            return self.drop_message(DropReason::StoreFailure);
        }

        if let Err(e) = self.registry.touch_last_seen(&meter_id, datetime_from_millis(now)).await {
            tracing::warn!(%meter_id, error = %e, "failed to update meter last-seen");
        }

        metrics::counter!("ingest_messages_stored_total").increment(1);
        IngestOutcome::Stored { meter_id, kind }
    }

    async fn store_data(&self, meter_id: &str, data: MeterDataSnapshot, now: i64) -> Result<(), StoreError> {
        let ts = reading_timestamp(data.timestamp, now);

        let newer = self
            .store
            .get_latest_data(meter_id)
            .await?
            .map_or(true, |cur| cur.timestamp <= ts);
        if newer {
            self.store
                .store_latest_data(LatestReading {
                    meter_id: meter_id.to_string(),
                    timestamp: ts,
                    received_at: now,
                    payload: data.clone(),
                })
                .await?;
        } else {
            tracing::debug!(meter_id, ts, "out-of-order data message kept in series only");
        }

        self.store
            .store_time_series_snapshot(TimeSeriesEntry::data(meter_id, ts, data))
            .await
    }

    async fn store_status(&self, meter_id: &str, status: MeterStatusSnapshot, now: i64) -> Result<(), StoreError> {
        let ts = reading_timestamp(status.timestamp, now);

        let newer = self
            .store
            .get_latest_status(meter_id)
            .await?
            .map_or(true, |cur| cur.timestamp <= ts);
        if newer {
            self.store
                .store_latest_status(LatestReading {
                    meter_id: meter_id.to_string(),
                    timestamp: ts,
                    received_at: now,
                    payload: status.clone(),
                })
                .await?;
        }

        self.store
            .store_time_series_snapshot(TimeSeriesEntry::status(meter_id, ts, status))
            .await
    }
}

fn reading_timestamp(device_ts: Option<i64>, now: i64) -> i64 {
    device_ts
        .and_then(device_timestamp_ms)
        .filter(|ts| *ts <= now + MAX_CLOCK_SKEW_MS)
        .unwrap_or(now)
}

#[async_trait::async_trait]
impl Sink<BrokerMessage> for IngestionAdapter {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: Stream<Item = Result<Envelope<BrokerMessage>, PipelineError>> + Send + Unpin + 'static,
    {
        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(error = %e, "error in upstream pipeline for IngestionAdapter");
                    continue;
                }
            };

            self.handle_message(&env.payload.topic, &env.payload.payload).await;

            if let Ok(dur) = std::time::SystemTime::now().duration_since(env.received_at) {
                metrics::histogram!("ingest_message_latency_seconds").record(dur.as_secs_f64());
            }
        }

        tracing::info!("broker source closed, ingestion stopped");
        Ok(())
    }
}
