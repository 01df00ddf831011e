use std::path::PathBuf;

use async_stream::try_stream;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};

use crate::pipeline::{BrokerMessage, Envelope, EnvelopeStream, PipelineError, Source};

/// Replays an NDJSON capture of broker traffic.
///
/// Each line is `{"topic": "<topic>", "payload": <json>}`; the payload is
/// re-serialised and handed on as raw bytes, exactly as a live delivery would be.
pub struct BrokerReplayFileSource {
    path: PathBuf,
}

#[derive(serde::Deserialize)]
struct CapturedMessage {
    topic: String,
    payload: serde_json::Value,
}

impl TryFrom<CapturedMessage> for BrokerMessage {
    type Error = serde_json::Error;

    fn try_from(c: CapturedMessage) -> Result<Self, Self::Error> {
        Ok(BrokerMessage {
            topic: c.topic,
            payload: serde_json::to_vec(&c.payload)?,
        })
    }
}

impl BrokerReplayFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl Source<BrokerMessage> for BrokerReplayFileSource {
    async fn stream(&self) -> EnvelopeStream<BrokerMessage> {
        let path = self.path.clone();
        let s = try_stream! {
            let file = File::open(&path).await.map_err(|e| {
                PipelineError::Source(format!("failed to open replay file: {e}"))
            })?;
            let reader = BufReader::new(file);
            let mut lines = reader.lines();

            while let Some(line) = lines.next_line().await.map_err(|e| {
                PipelineError::Source(format!("failed to read replay line: {e}"))
            })? {
                if line.trim().is_empty() {
                    continue;
                }
                let captured: CapturedMessage = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(e) => {
                        metrics::counter!("replay_parse_errors_total").increment(1);
                        tracing::warn!(error = %e, "skipping unparseable replay line");
                        continue;
                    }
                };
                let message = BrokerMessage::try_from(captured)
                    .map_err(|e| PipelineError::Source(format!("failed to re-encode payload: {e}")))?;
                yield Envelope::now(message);
            }
        };

        Box::pin(s)
    }
}
