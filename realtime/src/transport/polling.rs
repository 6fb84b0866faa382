use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Endpoint, RealtimeError, RealtimeResult, Transport, TransportKind};
use crate::protocol::{EnginePacket, RECORD_SEPARATOR};

/// Engine.IO HTTP long-polling transport.
///
/// A background task keeps one GET request outstanding and feeds every
/// received frame into a queue; outbound frames are POSTed one at a time.
pub struct PollingTransport {
    http_client: reqwest::Client,
    endpoint: Endpoint,
    sid: String,
    inbound: mpsc::UnboundedReceiver<RealtimeResult<String>>,
    poller: JoinHandle<()>,
    closed: bool,
}

impl PollingTransport {
    pub async fn connect(
        http_client: reqwest::Client,
        endpoint: &Endpoint,
    ) -> RealtimeResult<Self> {
        let url = endpoint.polling_url(None);
        debug!("Opening long-polling session at {}", url);

        let response = http_client.get(url).send().await?.error_for_status()?;
        let payload = response.text().await?;
        let frames = split_frames(&payload);

        let sid = match frames.first().map(|frame| EnginePacket::decode(frame)) {
            Some(Ok(EnginePacket::Open(handshake))) => handshake.sid,
            Some(Ok(other)) => {
                return Err(RealtimeError::Transport {
                    message: format!("expected open packet, got {:?}", other),
                })
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(RealtimeError::Transport {
                    message: "empty handshake response".to_string(),
                })
            }
        };
        info!("Long-polling session {} established with {}", sid, endpoint.base());

        let (tx, inbound) = mpsc::unbounded_channel();
        for frame in frames {
            let _ = tx.send(Ok(frame));
        }

        let poller = tokio::spawn(poll_loop(
            http_client.clone(),
            endpoint.clone(),
            sid.clone(),
            tx,
        ));

        Ok(Self {
            http_client,
            endpoint: endpoint.clone(),
            sid,
            inbound,
            poller,
            closed: false,
        })
    }

    async fn post(&self, body: String) -> RealtimeResult<()> {
        self.http_client
            .post(self.endpoint.polling_url(Some(&self.sid)))
            .header(reqwest::header::CONTENT_TYPE, "text/plain;charset=UTF-8")
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

async fn poll_loop(
    http_client: reqwest::Client,
    endpoint: Endpoint,
    sid: String,
    tx: mpsc::UnboundedSender<RealtimeResult<String>>,
) {
    loop {
        let result = async {
            let response = http_client
                .get(endpoint.polling_url(Some(&sid)))
                .send()
                .await?
                .error_for_status()?;
            response.text().await
        }
        .await;

        let payload = match result {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Long-poll request for session {} failed: {}", sid, e);
                let _ = tx.send(Err(e.into()));
                return;
            }
        };

        for frame in split_frames(&payload) {
            let closing = frame == EnginePacket::Close.encode();
            if tx.send(Ok(frame)).is_err() || closing {
                return;
            }
        }
    }
}

fn split_frames(payload: &str) -> Vec<String> {
    payload
        .split(RECORD_SEPARATOR)
        .filter(|frame| !frame.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    async fn send(&mut self, frame: String) -> RealtimeResult<()> {
        if self.closed {
            return Err(RealtimeError::Closed);
        }
        self.post(frame).await
    }

    async fn recv(&mut self) -> Option<RealtimeResult<String>> {
        if self.closed {
            return None;
        }
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.post(EnginePacket::Close.encode()).await {
            debug!("Failed to notify server of session close: {}", e);
        }
        self.poller.abort();
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        self.poller.abort();
    }
}
