#![allow(dead_code)]

use async_trait::async_trait;
use realtime::{
    Connector, CredentialStore, Endpoint, RealtimeError, RealtimeResult, Transport, TransportKind,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);
pub const NAMESPACE: &str = "/positions";

/// What the next call to `connect` should do.
#[derive(Debug, Clone, Copy)]
pub enum Plan {
    Accept,
    Fail,
}

/// Connector handing out in-memory transports whose server side is driven by the test.
pub struct MemoryConnector {
    plans: Mutex<VecDeque<Plan>>,
    default_plan: Plan,
    attempts: AtomicUsize,
    kinds: Mutex<Vec<TransportKind>>,
    sockets: mpsc::UnboundedSender<FakeServer>,
}

impl MemoryConnector {
    pub fn new(default_plan: Plan) -> (Self, mpsc::UnboundedReceiver<FakeServer>) {
        let (sockets, incoming) = mpsc::unbounded_channel();
        let connector = Self {
            plans: Mutex::new(VecDeque::new()),
            default_plan,
            attempts: AtomicUsize::new(0),
            kinds: Mutex::new(Vec::new()),
            sockets,
        };
        (connector, incoming)
    }

    pub fn with_plans(self, plans: impl IntoIterator<Item = Plan>) -> Self {
        self.plans.lock().unwrap().extend(plans);
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn kinds(&self) -> Vec<TransportKind> {
        self.kinds.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        _endpoint: &Endpoint,
        kind: TransportKind,
    ) -> RealtimeResult<Box<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.kinds.lock().unwrap().push(kind);

        let plan = self
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_plan);

        match plan {
            Plan::Fail => Err(RealtimeError::Transport {
                message: format!("{} refused", kind),
            }),
            Plan::Accept => {
                let (to_client, from_server) = mpsc::unbounded_channel();
                let (to_server, from_client) = mpsc::unbounded_channel();
                let _ = self.sockets.send(FakeServer {
                    to_client,
                    from_client,
                });
                Ok(Box::new(MemoryTransport {
                    kind,
                    to_server,
                    from_server,
                }))
            }
        }
    }
}

struct MemoryTransport {
    kind: TransportKind,
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn send(&mut self, frame: String) -> RealtimeResult<()> {
        self.to_server
            .send(frame)
            .map_err(|_| RealtimeError::Closed)
    }

    async fn recv(&mut self) -> Option<RealtimeResult<String>> {
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.from_server.close();
    }
}

/// Credential store whose every call fails, like an unreadable keychain.
pub struct BrokenCredentialStore;

#[async_trait]
impl CredentialStore for BrokenCredentialStore {
    async fn get_item(&self, _key: &str) -> RealtimeResult<Option<String>> {
        Err(RealtimeError::Credentials {
            message: "keychain locked".to_string(),
        })
    }

    async fn set_item(&self, _key: &str, _value: &str) -> RealtimeResult<()> {
        Err(RealtimeError::Credentials {
            message: "keychain locked".to_string(),
        })
    }

    async fn delete_item(&self, _key: &str) -> RealtimeResult<()> {
        Err(RealtimeError::Credentials {
            message: "keychain locked".to_string(),
        })
    }
}

/// Server end of one in-memory connection.
pub struct FakeServer {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl FakeServer {
    pub fn send(&self, frame: impl Into<String>) {
        let _ = self.to_client.send(frame.into());
    }

    pub async fn recv(&mut self) -> Option<String> {
        timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
    }

    /// Returns the next frame if one arrives within `wait`.
    pub async fn try_recv_within(&mut self, wait: Duration) -> Option<String> {
        timeout(wait, self.from_client.recv()).await.ok().flatten()
    }

    pub fn open(&self, ping_interval: u64, ping_timeout: u64) {
        self.send(format!(
            r#"0{{"sid":"test-sid","upgrades":[],"pingInterval":{},"pingTimeout":{},"maxPayload":1000000}}"#,
            ping_interval, ping_timeout
        ));
    }

    /// Runs the Engine.IO open and namespace connect; returns the auth
    /// payload the client presented.
    pub async fn accept(&mut self) -> Value {
        self.open(25_000, 20_000);
        let auth = self.expect_connect().await;
        self.send(format!(r#"40{},{{"sid":"ns-sid"}}"#, NAMESPACE));
        auth
    }

    pub async fn expect_connect(&mut self) -> Value {
        let frame = self.recv().await.expect("client hung up before connecting");
        let prefix = format!("40{},", NAMESPACE);
        let body = frame
            .strip_prefix(&prefix)
            .unwrap_or_else(|| panic!("expected namespace connect, got {}", frame));
        serde_json::from_str(body).expect("connect payload must be json")
    }

    pub fn reject(&self, message: &str) {
        self.send(format!(
            "44{},{}",
            NAMESPACE,
            json!({ "message": message })
        ));
    }

    pub fn emit(&self, name: &str, data: Value) {
        self.send(format!("42{},{}", NAMESPACE, json!([name, data])));
    }

    /// Next Socket.IO event sent by the client, skipping heartbeat replies.
    pub async fn next_event(&mut self) -> Option<(String, Value)> {
        let prefix = format!("42{},", NAMESPACE);
        loop {
            let frame = self.recv().await?;
            if let Some(body) = frame.strip_prefix(&prefix) {
                let args: Vec<Value> = serde_json::from_str(body).expect("event must be json");
                let name = args[0].as_str().expect("event name").to_string();
                let data = args.get(1).cloned().unwrap_or(Value::Null);
                return Some((name, data));
            }
        }
    }
}

pub fn position_json(device_id: &str, second: u32) -> Value {
    json!({
        "deviceId": device_id,
        "latitude": 18.47,
        "longitude": -69.90,
        "speed": 42,
        "course": 180,
        "altitude": 10,
        "timestamp": format!("2024-01-01T00:00:{:02}Z", second)
    })
}
