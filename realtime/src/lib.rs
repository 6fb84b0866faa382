pub mod channel;
pub mod config;
pub mod credentials;
pub mod listeners;
pub mod protocol;
pub mod transport;
pub mod types;

pub use channel::RealtimeChannel;
pub use config::{RealtimeConfig, ReconnectionPolicy};
pub use credentials::{
    CredentialStore, FileCredentialStore, MemoryCredentialStore, AUTH_TOKEN_KEY,
};
pub use listeners::{Listener, ListenerHandle, ListenerRegistry};
pub use protocol::{InboundEvent, OutboundEvent, ProtocolError};
pub use transport::{
    Connector, DefaultConnector, Endpoint, RealtimeError, RealtimeResult, Transport, TransportKind,
};
pub use types::{DeviceState, DeviceStatus, EventNotification, PositionUpdate, SubscriptionAck};

pub mod prelude {
    pub use crate::channel::*;
    pub use crate::config::*;
    pub use crate::credentials::*;
    pub use crate::listeners::*;
    pub use crate::transport::{
        Connector, DefaultConnector, Endpoint, RealtimeError, RealtimeResult, Transport,
        TransportKind,
    };
    pub use crate::types::*;
}
