use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    routing::post,
    Router,
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::pipeline::{BrokerMessage, Envelope, EnvelopeStream, PipelineError, Source};

#[derive(Clone)]
struct SharedSender {
    tx: mpsc::Sender<Envelope<BrokerMessage>>,
}

/// Receives broker deliveries forwarded by a bridge as `POST /deliver/<topic>`
/// with the raw message body.
///
/// The bridge owns the subscription and delivery guarantees; this source only
/// turns each delivery into a [`BrokerMessage`].
#[derive(Clone)]
pub struct BrokerHttpSource {
    receiver: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<Envelope<BrokerMessage>>>>>,
}

impl BrokerHttpSource {
    pub async fn new(bind_addr: &str, channel_capacity: usize, max_body_bytes: usize) -> Result<Self, PipelineError> {
        let (tx, rx) = mpsc::channel(channel_capacity);
        let shared = SharedSender { tx };

        let app = router(shared, max_body_bytes);

        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| PipelineError::Source(format!("invalid bind addr: {e}")))?;

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| PipelineError::Source(format!("failed to bind broker bridge listener: {e}")))?;
        tracing::info!(%addr, "broker bridge source listening");

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                tracing::error!(error = %e, "broker bridge source server error");
            }
        });

        Ok(Self {
            receiver: Arc::new(tokio::sync::Mutex::new(Some(rx))),
        })
    }
}

fn router(shared: SharedSender, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/deliver/*topic", post(deliver))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(shared)
}

#[async_trait::async_trait]
impl Source<BrokerMessage> for BrokerHttpSource {
    async fn stream(&self) -> EnvelopeStream<BrokerMessage> {
        let mut guard = self.receiver.lock().await;
        match guard.take() {
            Some(rx) => Box::pin(ReceiverStream::new(rx).map(Ok)),
            None => Box::pin(futures::stream::once(async {
                Err(PipelineError::Source(
                    "BrokerHttpSource stream already taken; only one consumer supported".to_string(),
                ))
            })),
        }
    }
}

async fn deliver(
    State(sender): State<SharedSender>,
    Path(topic): Path<String>,
    body: Bytes,
) -> StatusCode {
    metrics::counter!("broker_bridge_deliveries_total").increment(1);

    let env = Envelope::now(BrokerMessage {
        topic,
        payload: body.to_vec(),
    });

    match sender.tx.send(env).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_e) => {
            // Consumer gone; let the bridge redeliver elsewhere.
            metrics::counter!("broker_bridge_failed_total").increment(1);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
