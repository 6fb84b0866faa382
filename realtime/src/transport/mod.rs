use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::config::RealtimeConfig;
use crate::protocol::{ProtocolError, ENGINE_IO_VERSION};

pub mod polling;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use polling::PollingTransport;
#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[cfg(feature = "websocket")]
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Credential store error: {message}")]
    Credentials { message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Timed out: {message}")]
    Timeout { message: String },

    #[error("Connection rejected: {message}")]
    Rejected { message: String },

    #[error("Connection closed")]
    Closed,
}

pub type RealtimeResult<T> = Result<T, RealtimeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    WebSocket,
    Polling,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::WebSocket => write!(f, "websocket"),
            TransportKind::Polling => write!(f, "polling"),
        }
    }
}

/// A bidirectional stream of raw Engine.IO text frames.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    async fn send(&mut self, frame: String) -> RealtimeResult<()>;

    /// Next inbound frame, `None` once the peer has gone away.
    ///
    /// Must be cancel safe: the channel polls it alongside its command queue.
    async fn recv(&mut self) -> Option<RealtimeResult<String>>;

    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        kind: TransportKind,
    ) -> RealtimeResult<Box<dyn Transport>>;
}

/// Location of the Engine.IO endpoint behind a base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    base: Url,
    socket_path: String,
}

impl Endpoint {
    pub fn new(base_url: &str, socket_path: &str) -> RealtimeResult<Self> {
        let base = Url::parse(base_url).map_err(|e| RealtimeError::InvalidConfig {
            message: format!("Invalid base URL '{}': {}", base_url, e),
        })?;

        if !matches!(base.scheme(), "http" | "https") {
            return Err(RealtimeError::InvalidConfig {
                message: format!("Unsupported URL scheme: {}", base.scheme()),
            });
        }

        Ok(Self {
            base,
            socket_path: socket_path.to_string(),
        })
    }

    pub fn from_config(config: &RealtimeConfig) -> RealtimeResult<Self> {
        Self::new(&config.base_url, &config.socket_path)
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn polling_url(&self, sid: Option<&str>) -> Url {
        let mut url = self.engine_url(TransportKind::Polling, sid);
        // Cache buster, some proxies serve stale long-poll responses otherwise.
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        url.query_pairs_mut().append_pair("t", &format!("{:x}", nonce));
        url
    }

    pub fn websocket_url(&self, sid: Option<&str>) -> Url {
        let mut url = self.engine_url(TransportKind::WebSocket, sid);
        let scheme = if self.base.scheme() == "https" {
            "wss"
        } else {
            "ws"
        };
        // http -> ws and https -> wss are both permitted scheme changes.
        let _ = url.set_scheme(scheme);
        url
    }

    fn engine_url(&self, kind: TransportKind, sid: Option<&str>) -> Url {
        let mut url = self.base.clone();
        let prefix = self.base.path().trim_end_matches('/');
        url.set_path(&format!("{}{}", prefix, self.socket_path));
        url.set_query(None);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("EIO", &ENGINE_IO_VERSION.to_string());
            query.append_pair("transport", &kind.to_string());
            if let Some(sid) = sid {
                query.append_pair("sid", sid);
            }
        }
        url
    }
}

/// Opens the built-in WebSocket and long-polling transports.
pub struct DefaultConnector {
    http_client: reqwest::Client,
}

impl DefaultConnector {
    pub fn new(config: &RealtimeConfig) -> RealtimeResult<Self> {
        // Long-poll requests are held open by the server for up to a ping
        // interval, so the HTTP timeout only bounds the connection phase.
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| RealtimeError::Transport {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        kind: TransportKind,
    ) -> RealtimeResult<Box<dyn Transport>> {
        match kind {
            #[cfg(feature = "websocket")]
            TransportKind::WebSocket => {
                let transport = WebSocketTransport::connect(endpoint).await?;
                Ok(Box::new(transport))
            }
            #[cfg(not(feature = "websocket"))]
            TransportKind::WebSocket => Err(RealtimeError::Transport {
                message: "WebSocket support is not compiled in".to_string(),
            }),
            TransportKind::Polling => {
                let transport =
                    PollingTransport::connect(self.http_client.clone(), endpoint).await?;
                Ok(Box::new(transport))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(url: &Url, key: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn test_endpoint_urls() {
        let endpoint = Endpoint::new("http://localhost:3001", "/socket.io/").unwrap();

        let polling = endpoint.polling_url(None);
        assert_eq!(polling.scheme(), "http");
        assert_eq!(polling.path(), "/socket.io/");
        assert_eq!(query(&polling, "EIO").as_deref(), Some("4"));
        assert_eq!(query(&polling, "transport").as_deref(), Some("polling"));
        assert!(query(&polling, "sid").is_none());
        assert!(query(&polling, "t").is_some());

        let ws = endpoint.websocket_url(Some("abc"));
        assert_eq!(ws.scheme(), "ws");
        assert_eq!(query(&ws, "transport").as_deref(), Some("websocket"));
        assert_eq!(query(&ws, "sid").as_deref(), Some("abc"));
    }

    #[test]
    fn test_endpoint_keeps_base_path_and_tls() {
        let endpoint = Endpoint::new("https://api.example.com/tracker/", "/socket.io/").unwrap();
        let ws = endpoint.websocket_url(None);
        assert_eq!(ws.scheme(), "wss");
        assert_eq!(ws.path(), "/tracker/socket.io/");
    }

    #[test]
    fn test_endpoint_rejects_bad_urls() {
        assert!(matches!(
            Endpoint::new("not a url", "/socket.io/"),
            Err(RealtimeError::InvalidConfig { .. })
        ));
        assert!(matches!(
            Endpoint::new("ftp://example.com", "/socket.io/"),
            Err(RealtimeError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_transport_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&TransportKind::WebSocket).unwrap(),
            "\"websocket\""
        );
        assert_eq!(TransportKind::Polling.to_string(), "polling");
    }
}
