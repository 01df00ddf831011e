//! Control messages pushed back to meters over `<namespace>/meters/command/<meterId>`.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("command transport error: {0}")]
    Transport(String),
    #[error("command encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridMode {
    Import,
    Export,
    Off,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnergyCommand {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_settlement: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MeterCommand {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid: Option<GridMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy: Option<EnergyCommand>,
}

impl MeterCommand {
    /// Zero the device-side settlement counters.
    pub fn reset_settlement() -> Self {
        Self {
            grid: None,
            energy: Some(EnergyCommand {
                reset_settlement: Some("all".to_string()),
            }),
        }
    }

    pub fn grid(mode: GridMode) -> Self {
        Self {
            grid: Some(mode),
            energy: None,
        }
    }
}

/// Wire form of a command: the command fields plus delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(flatten)]
    pub command: MeterCommand,
    pub correlation_id: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

pub fn command_topic(namespace: &str, meter_id: &str) -> String {
    format!("{namespace}/meters/command/{meter_id}")
}

/// Deterministic correlation id over meter, time and a per-process sequence.
pub fn correlation_id(meter_id: &str, timestamp_ms: i64, seq: u64) -> String {
    let mut h = blake3::Hasher::new();
    h.update(&(meter_id.len() as u32).to_le_bytes());
    h.update(meter_id.as_bytes());
    h.update(&timestamp_ms.to_le_bytes());
    h.update(&seq.to_le_bytes());
    let hex = h.finalize().to_hex();
    hex.as_str()[..32].to_string()
}

#[async_trait::async_trait]
pub trait CommandChannel: Send + Sync {
    /// Publish a command; returns the correlation id used.
    async fn send(&self, meter_id: &str, command: MeterCommand) -> Result<String, CommandError>;
}

/// Publishes commands through the broker bridge's HTTP publish endpoint.
pub struct HttpCommandChannel {
    http: reqwest::Client,
    publish_url: String,
    namespace: String,
    seq: AtomicU64,
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    topic: String,
    payload: &'a CommandEnvelope,
    qos: u8,
}

impl HttpCommandChannel {
    pub fn new(publish_url: impl Into<String>, namespace: impl Into<String>) -> Result<Self, CommandError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CommandError::Transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            publish_url: publish_url.into(),
            namespace: namespace.into(),
            seq: AtomicU64::new(0),
        })
    }
}

#[async_trait::async_trait]
impl CommandChannel for HttpCommandChannel {
    async fn send(&self, meter_id: &str, command: MeterCommand) -> Result<String, CommandError> {
        let timestamp = (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let envelope = CommandEnvelope {
            command,
            correlation_id: correlation_id(meter_id, timestamp, seq),
            timestamp,
        };

        let req = PublishRequest {
            topic: command_topic(&self.namespace, meter_id),
            payload: &envelope,
            // At-least-once.
            qos: 1,
        };

        let response = self
            .http
            .post(&self.publish_url)
            .json(&req)
            .send()
            .await
            .map_err(|e| CommandError::Transport(format!("publish failed: {e}")))?;
        if !response.status().is_success() {
            return Err(CommandError::Transport(format!(
                "bridge returned HTTP {}",
                response.status()
            )));
        }

        metrics::counter!("meter_commands_sent_total").increment(1);
        tracing::debug!(meter_id, correlation_id = %envelope.correlation_id, "command published");
        Ok(envelope.correlation_id)
    }
}
