use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use super::{Endpoint, RealtimeError, RealtimeResult, Transport, TransportKind};

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

impl WebSocketTransport {
    pub async fn connect(endpoint: &Endpoint) -> RealtimeResult<Self> {
        let url = endpoint.websocket_url(None);
        debug!("Opening WebSocket to {}", url);

        let (stream, response) = connect_async(url.as_str()).await?;
        info!(
            "WebSocket established with {} (HTTP {})",
            endpoint.base(),
            response.status()
        );

        Ok(Self {
            stream,
            closed: false,
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn send(&mut self, frame: String) -> RealtimeResult<()> {
        if self.closed {
            return Err(RealtimeError::Closed);
        }
        self.stream.send(Message::Text(frame)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<RealtimeResult<String>> {
        if self.closed {
            return None;
        }

        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(frame)) => {
                    debug!("WebSocket closed by server: {:?}", frame);
                    self.closed = true;
                    return None;
                }
                Ok(Message::Binary(_)) => {
                    return Some(Err(RealtimeError::Transport {
                        message: "binary frames are not supported".to_string(),
                    }))
                }
                // Control frames are answered by tungstenite itself.
                Ok(_) => continue,
                Err(e) => {
                    self.closed = true;
                    return Some(Err(e.into()));
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.close(None).await {
            debug!("Error while closing WebSocket: {}", e);
        }
    }
}
