//! The realtime position channel.
//!
//! A [`RealtimeChannel`] owns one supervised Socket.IO connection to the
//! `/positions` namespace. A background task fetches the bearer credential,
//! connects (WebSocket first, long-polling as fallback), answers heartbeats,
//! decodes inbound events and fans them out to the registered listeners. When
//! the connection drops it reconnects with bounded, randomized backoff and
//! replays the device subscriptions that were active before the drop.
//!
//! ```no_run
//! use realtime::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let credentials = Arc::new(MemoryCredentialStore::with_token("bearer-token"));
//! let channel = RealtimeChannel::new(RealtimeConfig::from_env(), credentials)?;
//!
//! let handle = channel.on_position_update(|position: &PositionUpdate| {
//!     println!("{} is at {}, {}", position.device_id, position.latitude, position.longitude);
//! });
//!
//! channel.connection_state().wait_for(|connected| *connected).await?;
//! channel.subscribe_to_device("truck-7");
//!
//! handle.unsubscribe();
//! channel.close().await;
//! # Ok(())
//! # }
//! ```

use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::RealtimeConfig;
use crate::credentials::CredentialStore;
use crate::listeners::{Listener, ListenerHandle, ListenerRegistry};
use crate::protocol::{EnginePacket, Handshake, InboundEvent, OutboundEvent, SocketPacket};
use crate::transport::{
    Connector, DefaultConnector, Endpoint, RealtimeError, RealtimeResult, Transport,
};
use crate::types::{DeviceStatus, EventNotification, PositionUpdate};

#[derive(Debug)]
enum Command {
    Emit(OutboundEvent),
    Shutdown,
}

/// State shared between the channel handle and its supervisor task.
pub(crate) struct Shared {
    positions: ListenerRegistry<PositionUpdate>,
    statuses: ListenerRegistry<DeviceStatus>,
    events: ListenerRegistry<EventNotification>,
    connected: watch::Sender<bool>,
    last_position: watch::Sender<Option<PositionUpdate>>,
    devices: Mutex<BTreeSet<String>>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            positions: ListenerRegistry::new(),
            statuses: ListenerRegistry::new(),
            events: ListenerRegistry::new(),
            connected: watch::channel(false).0,
            last_position: watch::channel(None).0,
            devices: Mutex::new(BTreeSet::new()),
        }
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn set_connected(&self, value: bool) {
        self.connected.send_if_modified(|connected| {
            let changed = *connected != value;
            *connected = value;
            changed
        });
    }

    fn devices(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Applies one decoded server event: updates the cached last position
    /// and fans the payload out to the matching listeners.
    pub(crate) fn apply(&self, event: InboundEvent) {
        match event {
            InboundEvent::PositionUpdate(position) => {
                self.last_position.send_replace(Some(position.clone()));
                self.positions.dispatch(&position);
            }
            InboundEvent::PositionsBatch(positions) => {
                let Some(last) = positions.last() else {
                    debug!("Ignoring empty position batch");
                    return;
                };
                self.last_position.send_replace(Some(last.clone()));
                for position in &positions {
                    self.positions.dispatch(position);
                }
            }
            InboundEvent::DeviceStatus(status) => {
                self.statuses.dispatch(&status);
            }
            InboundEvent::Notification(event) => {
                self.events.dispatch(&event);
            }
            InboundEvent::Subscribed(ack) => {
                info!("Subscribed to device {}", ack.device_id);
            }
            InboundEvent::Connected(message) => {
                info!("Server greeting: {}", message);
            }
            InboundEvent::Unknown { name } => {
                debug!("Ignoring unknown event '{}'", name);
            }
        }
    }
}

/// Handle to a supervised realtime connection.
///
/// Dropping the handle (or calling [`RealtimeChannel::disconnect`]) tears the
/// connection down and cancels any pending reconnection.
pub struct RealtimeChannel {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeChannel {
    /// Mounts a channel using the built-in WebSocket and long-polling transports.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: RealtimeConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> RealtimeResult<Self> {
        let connector = DefaultConnector::new(&config)?;
        Self::with_connector(config, credentials, Arc::new(connector))
    }

    pub fn with_connector(
        config: RealtimeConfig,
        credentials: Arc<dyn CredentialStore>,
        connector: Arc<dyn Connector>,
    ) -> RealtimeResult<Self> {
        config
            .validate()
            .map_err(|message| RealtimeError::InvalidConfig { message })?;
        let endpoint = Endpoint::from_config(&config)?;

        let shared = Arc::new(Shared::new());
        let (commands, command_rx) = mpsc::unbounded_channel();

        let supervisor = Supervisor {
            shared: shared.clone(),
            config,
            endpoint,
            credentials,
            connector,
        };
        let handle = tokio::spawn(supervisor.run(command_rx));

        Ok(Self {
            shared,
            commands,
            supervisor: Mutex::new(Some(handle)),
        })
    }

    /// Asks the server for updates about `device_id`. Does nothing while
    /// disconnected; subscriptions sent while connected are replayed after
    /// every reconnection.
    pub fn subscribe_to_device(&self, device_id: impl Into<String>) {
        let device_id = device_id.into();
        if !self.is_connected() {
            debug!("Not connected, skipping subscription to {}", device_id);
            return;
        }
        self.shared.devices().insert(device_id.clone());
        let _ = self
            .commands
            .send(Command::Emit(OutboundEvent::SubscribeDevice(device_id)));
    }

    pub fn unsubscribe_from_device(&self, device_id: impl Into<String>) {
        let device_id = device_id.into();
        if !self.is_connected() {
            debug!("Not connected, skipping unsubscription from {}", device_id);
            return;
        }
        self.shared.devices().remove(&device_id);
        let _ = self
            .commands
            .send(Command::Emit(OutboundEvent::UnsubscribeDevice(device_id)));
    }

    pub fn on_position_update(
        &self,
        listener: impl Into<Listener<PositionUpdate>>,
    ) -> ListenerHandle {
        self.shared.positions.add(listener)
    }

    pub fn on_device_status(&self, listener: impl Into<Listener<DeviceStatus>>) -> ListenerHandle {
        self.shared.statuses.add(listener)
    }

    pub fn on_event(&self, listener: impl Into<Listener<EventNotification>>) -> ListenerHandle {
        self.shared.events.add(listener)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Receiver that observes every change of the connected flag.
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub fn last_position(&self) -> Option<PositionUpdate> {
        self.shared.last_position.borrow().clone()
    }

    pub fn watch_last_position(&self) -> watch::Receiver<Option<PositionUpdate>> {
        self.shared.last_position.subscribe()
    }

    /// Devices that will be re-subscribed after a reconnection.
    pub fn subscribed_devices(&self) -> Vec<String> {
        self.shared.devices().iter().cloned().collect()
    }

    /// Stops the supervisor: closes the transport if one is open and cancels
    /// any pending reconnection. Safe to call more than once.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Like [`RealtimeChannel::disconnect`], but waits for the supervisor to finish.
    pub async fn close(self) {
        self.disconnect();
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Realtime supervisor ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

enum ConnectFailure {
    /// The server refused the namespace connection, retrying will not help.
    Rejected(String),
    Failed(RealtimeError),
}

enum SessionEnd {
    Lost(String),
    ServerDisconnect,
    Rejected(String),
    Shutdown,
}

struct Supervisor {
    shared: Arc<Shared>,
    config: RealtimeConfig,
    endpoint: Endpoint,
    credentials: Arc<dyn CredentialStore>,
    connector: Arc<dyn Connector>,
}

impl Supervisor {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let credentials = self.credentials.clone();
        let key = self.config.credential_key.clone();
        let token = tokio::select! {
            token = credentials.get_item(&key) => token,
            _ = wait_for_shutdown(&mut commands) => return,
        };

        let token = match token {
            Ok(Some(token)) if !token.is_empty() => token,
            Ok(_) => {
                warn!("No credential stored under '{}', not connecting", key);
                return;
            }
            Err(e) => {
                error!("Failed to read credential '{}': {}", key, e);
                return;
            }
        };

        let policy = self.config.reconnection.clone();
        let mut attempt = 0u32;

        loop {
            let outcome = tokio::select! {
                outcome = self.establish(&token) => outcome,
                _ = wait_for_shutdown(&mut commands) => return,
            };

            match outcome {
                Ok(session) => {
                    attempt = 0;
                    info!(
                        "Connected to {}{} over {}",
                        self.endpoint.base(),
                        self.config.namespace,
                        session.transport.kind()
                    );

                    let end = session
                        .run(&self.shared, &self.config.namespace, &mut commands)
                        .await;
                    self.shared.set_connected(false);

                    match end {
                        SessionEnd::Shutdown => {
                            info!("Realtime channel closed");
                            return;
                        }
                        SessionEnd::ServerDisconnect => {
                            info!("Server closed the {} namespace", self.config.namespace);
                            return;
                        }
                        SessionEnd::Rejected(message) => {
                            warn!("Connection rejected by server: {}", message);
                            return;
                        }
                        SessionEnd::Lost(reason) => {
                            warn!("Disconnected: {}", reason);
                        }
                    }
                }
                Err(ConnectFailure::Rejected(message)) => {
                    self.shared.set_connected(false);
                    warn!("Connection rejected by server: {}", message);
                    return;
                }
                Err(ConnectFailure::Failed(e)) => {
                    self.shared.set_connected(false);
                    warn!("Connection error: {}", e);
                }
            }

            if !policy.enabled {
                info!("Reconnection disabled, staying disconnected");
                return;
            }

            if attempt >= policy.max_attempts {
                error!(
                    "Giving up after {} reconnection attempts, staying disconnected",
                    attempt
                );
                return;
            }

            let delay = policy.delay_for(attempt);
            attempt += 1;
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay, attempt, policy.max_attempts
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = wait_for_shutdown(&mut commands) => return,
            }
        }
    }

    /// Tries each configured transport in order until one completes the
    /// namespace handshake.
    async fn establish(&self, token: &str) -> Result<Session, ConnectFailure> {
        let mut last_error = RealtimeError::Transport {
            message: "no transport configured".to_string(),
        };

        for &kind in &self.config.transports {
            let attempt = timeout(self.config.connect_timeout, async {
                let transport = self
                    .connector
                    .connect(&self.endpoint, kind)
                    .await
                    .map_err(ConnectFailure::Failed)?;
                Session::open(transport, &self.config.namespace, token).await
            })
            .await;

            match attempt {
                Ok(Ok(session)) => return Ok(session),
                Ok(Err(ConnectFailure::Rejected(message))) => {
                    return Err(ConnectFailure::Rejected(message))
                }
                Ok(Err(ConnectFailure::Failed(e))) => {
                    debug!("{} transport failed: {}", kind, e);
                    last_error = e;
                }
                Err(_) => {
                    debug!("{} transport timed out", kind);
                    last_error = RealtimeError::Timeout {
                        message: format!(
                            "{} handshake did not complete within {:?}",
                            kind, self.config.connect_timeout
                        ),
                    };
                }
            }
        }

        Err(ConnectFailure::Failed(last_error))
    }
}

/// Resolves once the channel handle asked for shutdown or went away.
/// Subscription requests that arrive meanwhile are dropped.
async fn wait_for_shutdown(commands: &mut mpsc::UnboundedReceiver<Command>) {
    loop {
        match commands.recv().await {
            Some(Command::Shutdown) | None => return,
            Some(Command::Emit(event)) => {
                debug!("Dropping {} while disconnected", event.name());
            }
        }
    }
}

enum Step {
    Frame(Option<RealtimeResult<String>>),
    Command(Option<Command>),
    HeartbeatExpired,
}

struct Session {
    transport: Box<dyn Transport>,
    handshake: Handshake,
}

impl Session {
    /// Runs the Engine.IO open and the authenticated namespace connect.
    async fn open(
        mut transport: Box<dyn Transport>,
        namespace: &str,
        token: &str,
    ) -> Result<Self, ConnectFailure> {
        let handshake = match next_frame(&mut transport).await? {
            EnginePacket::Open(handshake) => handshake,
            other => {
                return Err(ConnectFailure::Failed(RealtimeError::Transport {
                    message: format!("expected open packet, got {:?}", other),
                }))
            }
        };
        debug!("Engine.IO session {} opened", handshake.sid);

        let connect = SocketPacket::Connect {
            namespace: namespace.to_string(),
            data: Some(json!({ "token": token })),
        };
        transport
            .send(EnginePacket::Message(connect.encode()).encode())
            .await
            .map_err(ConnectFailure::Failed)?;

        loop {
            match next_frame(&mut transport).await? {
                EnginePacket::Ping(probe) => transport
                    .send(EnginePacket::Pong(probe).encode())
                    .await
                    .map_err(ConnectFailure::Failed)?,
                EnginePacket::Message(data) => {
                    let packet = SocketPacket::decode(&data)
                        .map_err(|e| ConnectFailure::Failed(e.into()))?;
                    if packet.namespace() != namespace {
                        continue;
                    }
                    match packet {
                        SocketPacket::Connect { .. } => {
                            return Ok(Self {
                                transport,
                                handshake,
                            })
                        }
                        SocketPacket::ConnectError { message, .. } => {
                            transport.close().await;
                            return Err(ConnectFailure::Rejected(message));
                        }
                        other => debug!("Ignoring {:?} before namespace connect", other),
                    }
                }
                EnginePacket::Close => {
                    return Err(ConnectFailure::Failed(RealtimeError::Closed));
                }
                _ => {}
            }
        }
    }

    async fn run(
        mut self,
        shared: &Shared,
        namespace: &str,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> SessionEnd {
        // Emits queued before this point are covered by the replay below.
        loop {
            match commands.try_recv() {
                Ok(Command::Emit(_)) => continue,
                Ok(Command::Shutdown) | Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.shutdown(namespace).await;
                    return SessionEnd::Shutdown;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
            }
        }

        let replay: Vec<String> = shared.devices().iter().cloned().collect();
        for device_id in replay {
            debug!("Replaying subscription to {}", device_id);
            let frame = OutboundEvent::SubscribeDevice(device_id).encode(namespace);
            if let Err(e) = self.transport.send(frame).await {
                return SessionEnd::Lost(e.to_string());
            }
        }

        // Subscriptions are accepted from here on, after the replay.
        shared.set_connected(true);

        let deadline = self.handshake.heartbeat_deadline();
        let mut last_seen = Instant::now();

        loop {
            let step = tokio::select! {
                frame = self.transport.recv() => Step::Frame(frame),
                command = commands.recv() => Step::Command(command),
                _ = sleep_until(last_seen + deadline) => Step::HeartbeatExpired,
            };

            match step {
                Step::Frame(None) => return SessionEnd::Lost("transport closed".to_string()),
                Step::Frame(Some(Err(e))) => return SessionEnd::Lost(e.to_string()),
                Step::Frame(Some(Ok(frame))) => {
                    last_seen = Instant::now();
                    if let Some(end) = self.handle_frame(&frame, shared, namespace).await {
                        return end;
                    }
                }
                Step::Command(Some(Command::Emit(event))) => {
                    debug!("Emitting {}", event.name());
                    if let Err(e) = self.transport.send(event.encode(namespace)).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }
                Step::Command(Some(Command::Shutdown)) | Step::Command(None) => {
                    self.shutdown(namespace).await;
                    return SessionEnd::Shutdown;
                }
                Step::HeartbeatExpired => {
                    self.transport.close().await;
                    return SessionEnd::Lost("ping timeout".to_string());
                }
            }
        }
    }

    async fn shutdown(&mut self, namespace: &str) {
        let goodbye = SocketPacket::Disconnect {
            namespace: namespace.to_string(),
        };
        if let Err(e) = self
            .transport
            .send(EnginePacket::Message(goodbye.encode()).encode())
            .await
        {
            debug!("Failed to send namespace disconnect: {}", e);
        }
        self.transport.close().await;
    }

    async fn handle_frame(
        &mut self,
        frame: &str,
        shared: &Shared,
        namespace: &str,
    ) -> Option<SessionEnd> {
        let packet = match EnginePacket::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Discarding undecodable frame: {}", e);
                return None;
            }
        };

        match packet {
            EnginePacket::Ping(probe) => {
                if let Err(e) = self.transport.send(EnginePacket::Pong(probe).encode()).await {
                    return Some(SessionEnd::Lost(e.to_string()));
                }
            }
            EnginePacket::Close => {
                return Some(SessionEnd::Lost("transport close".to_string()));
            }
            EnginePacket::Message(data) => {
                let packet = match SocketPacket::decode(&data) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!("Discarding malformed packet: {}", e);
                        return None;
                    }
                };
                if packet.namespace() != namespace {
                    debug!("Ignoring packet for namespace {}", packet.namespace());
                    return None;
                }

                match packet {
                    SocketPacket::Event { name, data, .. } => {
                        debug!("Received '{}'", name);
                        match InboundEvent::decode(&name, data) {
                            Ok(event) => shared.apply(event),
                            Err(e) => warn!("Dropping event: {}", e),
                        }
                    }
                    SocketPacket::Disconnect { .. } => {
                        self.transport.close().await;
                        return Some(SessionEnd::ServerDisconnect);
                    }
                    SocketPacket::ConnectError { message, .. } => {
                        self.transport.close().await;
                        return Some(SessionEnd::Rejected(message));
                    }
                    SocketPacket::Connect { .. } => {}
                }
            }
            EnginePacket::Open(_)
            | EnginePacket::Pong(_)
            | EnginePacket::Upgrade
            | EnginePacket::Noop => {}
        }

        None
    }
}

async fn next_frame(transport: &mut Box<dyn Transport>) -> Result<EnginePacket, ConnectFailure> {
    match transport.recv().await {
        Some(Ok(frame)) => {
            EnginePacket::decode(&frame).map_err(|e| ConnectFailure::Failed(e.into()))
        }
        Some(Err(e)) => Err(ConnectFailure::Failed(e)),
        None => Err(ConnectFailure::Failed(RealtimeError::Closed)),
    }
}
