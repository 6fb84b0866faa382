//! Socket.IO v4 framing on top of Engine.IO v4.
//!
//! Engine.IO carries the heartbeat and the raw text frames; Socket.IO adds
//! namespaces and named events inside Engine.IO `message` packets. Only the
//! text subset used by the position channel is supported: binary events and
//! acknowledgements are rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::types::{DeviceStatus, EventNotification, PositionUpdate, SubscriptionAck};

pub const ENGINE_IO_VERSION: u8 = 4;

/// Separator between packets in a long-polling payload.
pub const RECORD_SEPARATOR: char = '\x1e';

pub const EVENT_POSITION_UPDATE: &str = "position:update";
pub const EVENT_POSITIONS_BATCH: &str = "positions:batch";
pub const EVENT_DEVICE_STATUS: &str = "device:status";
pub const EVENT_NOTIFICATION: &str = "event:notification";
pub const EVENT_SUBSCRIBED: &str = "subscribed";
pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_SUBSCRIBE_DEVICE: &str = "subscribe:device";
pub const EVENT_UNSUBSCRIBE_DEVICE: &str = "unsubscribe:device";

#[derive(Error, Debug, PartialEq)]
pub enum ProtocolError {
    #[error("Empty packet")]
    Empty,

    #[error("Unknown packet type: {0}")]
    UnknownType(char),

    #[error("Unsupported packet: {message}")]
    Unsupported { message: String },

    #[error("Malformed packet: {message}")]
    Malformed { message: String },

    #[error("Invalid payload for '{event}': {message}")]
    InvalidPayload { event: String, message: String },
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Session parameters announced by the server in the Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

impl Handshake {
    /// Longest silence tolerated before the connection is considered dead.
    pub fn heartbeat_deadline(&self) -> Duration {
        Duration::from_millis(self.ping_interval + self.ping_timeout)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(Handshake),
    Close,
    Ping(Option<String>),
    Pong(Option<String>),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(handshake) => format!(
                "0{}",
                serde_json::to_string(handshake).unwrap_or_else(|_| "{}".to_string())
            ),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(probe) => format!("2{}", probe.as_deref().unwrap_or_default()),
            EnginePacket::Pong(probe) => format!("3{}", probe.as_deref().unwrap_or_default()),
            EnginePacket::Message(data) => format!("4{}", data),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }

    pub fn decode(frame: &str) -> ProtocolResult<Self> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or(ProtocolError::Empty)?;
        let rest = chars.as_str();
        let probe = || (!rest.is_empty()).then(|| rest.to_string());

        match kind {
            '0' => serde_json::from_str(rest)
                .map(EnginePacket::Open)
                .map_err(|e| ProtocolError::Malformed {
                    message: format!("invalid handshake: {}", e),
                }),
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping(probe())),
            '3' => Ok(EnginePacket::Pong(probe())),
            '4' => Ok(EnginePacket::Message(rest.to_string())),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            'b' => Err(ProtocolError::Unsupported {
                message: "binary engine packets".to_string(),
            }),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }

    /// Splits a long-polling payload into its packets.
    pub fn decode_payload(payload: &str) -> ProtocolResult<Vec<Self>> {
        payload
            .split(RECORD_SEPARATOR)
            .filter(|frame| !frame.is_empty())
            .map(Self::decode)
            .collect()
    }

    pub fn encode_payload(packets: &[Self]) -> String {
        packets
            .iter()
            .map(Self::encode)
            .collect::<Vec<_>>()
            .join(&RECORD_SEPARATOR.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        namespace: String,
        data: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        name: String,
        data: Value,
    },
    ConnectError {
        namespace: String,
        message: String,
    },
}

impl SocketPacket {
    pub fn namespace(&self) -> &str {
        match self {
            SocketPacket::Connect { namespace, .. }
            | SocketPacket::Disconnect { namespace }
            | SocketPacket::Event { namespace, .. }
            | SocketPacket::ConnectError { namespace, .. } => namespace,
        }
    }

    pub fn encode(&self) -> String {
        let (kind, body) = match self {
            SocketPacket::Connect { data, .. } => (
                '0',
                data.as_ref().map(Value::to_string).unwrap_or_default(),
            ),
            SocketPacket::Disconnect { .. } => ('1', String::new()),
            SocketPacket::Event { name, data, .. } => {
                let args = if data.is_null() {
                    Value::Array(vec![Value::String(name.clone())])
                } else {
                    Value::Array(vec![Value::String(name.clone()), data.clone()])
                };
                ('2', args.to_string())
            }
            SocketPacket::ConnectError { message, .. } => {
                ('4', serde_json::json!({ "message": message }).to_string())
            }
        };

        let namespace = self.namespace();
        if namespace == "/" || namespace.is_empty() {
            format!("{}{}", kind, body)
        } else {
            format!("{}{},{}", kind, namespace, body)
        }
    }

    pub fn decode(frame: &str) -> ProtocolResult<Self> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or(ProtocolError::Empty)?;
        let mut rest = chars.as_str();

        if matches!(kind, '3' | '5' | '6') {
            return Err(ProtocolError::Unsupported {
                message: format!("socket packet type {}", kind),
            });
        }

        let namespace = if rest.starts_with('/') {
            match rest.find(',') {
                Some(idx) => {
                    let namespace = &rest[..idx];
                    rest = &rest[idx + 1..];
                    namespace.to_string()
                }
                None => {
                    let namespace = rest.to_string();
                    rest = "";
                    namespace
                }
            }
        } else {
            "/".to_string()
        };

        // Ack ids are not requested by this client; skip any the server sent.
        let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());

        let body = if rest.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str::<Value>(rest).map_err(|e| ProtocolError::Malformed {
                    message: format!("invalid json body: {}", e),
                })?,
            )
        };

        match kind {
            '0' => Ok(SocketPacket::Connect {
                namespace,
                data: body,
            }),
            '1' => Ok(SocketPacket::Disconnect { namespace }),
            '2' => {
                let mut args = match body {
                    Some(Value::Array(args)) => args.into_iter(),
                    _ => {
                        return Err(ProtocolError::Malformed {
                            message: "event body must be an array".to_string(),
                        })
                    }
                };
                let name = match args.next() {
                    Some(Value::String(name)) => name,
                    _ => {
                        return Err(ProtocolError::Malformed {
                            message: "event name must be a string".to_string(),
                        })
                    }
                };
                Ok(SocketPacket::Event {
                    namespace,
                    name,
                    data: args.next().unwrap_or(Value::Null),
                })
            }
            '4' => {
                let message = match body {
                    Some(Value::String(message)) => message,
                    Some(Value::Object(obj)) => obj
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("connection refused")
                        .to_string(),
                    _ => "connection refused".to_string(),
                };
                Ok(SocketPacket::ConnectError { namespace, message })
            }
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

/// A decoded and validated server event on the position namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Connected(String),
    Subscribed(SubscriptionAck),
    PositionUpdate(PositionUpdate),
    PositionsBatch(Vec<PositionUpdate>),
    DeviceStatus(DeviceStatus),
    Notification(EventNotification),
    Unknown { name: String },
}

impl InboundEvent {
    pub fn decode(name: &str, data: Value) -> ProtocolResult<Self> {
        match name {
            EVENT_POSITION_UPDATE => {
                let position: PositionUpdate = parse_payload(name, data)?;
                position.validate().map_err(|message| invalid(name, message))?;
                Ok(InboundEvent::PositionUpdate(position))
            }
            EVENT_POSITIONS_BATCH => {
                let items = match data {
                    Value::Array(items) => items,
                    _ => return Err(invalid(name, "batch payload must be an array")),
                };
                let positions = items
                    .into_iter()
                    .enumerate()
                    .filter_map(|(index, item)| {
                        let parsed = serde_json::from_value::<PositionUpdate>(item)
                            .map_err(|e| e.to_string())
                            .and_then(|position| position.validate().map(|_| position));
                        match parsed {
                            Ok(position) => Some(position),
                            Err(e) => {
                                warn!("Dropping invalid batch element {}: {}", index, e);
                                None
                            }
                        }
                    })
                    .collect();
                Ok(InboundEvent::PositionsBatch(positions))
            }
            EVENT_DEVICE_STATUS => {
                let status: DeviceStatus = parse_payload(name, data)?;
                status.validate().map_err(|message| invalid(name, message))?;
                Ok(InboundEvent::DeviceStatus(status))
            }
            EVENT_NOTIFICATION => {
                let event: EventNotification = parse_payload(name, data)?;
                event.validate().map_err(|message| invalid(name, message))?;
                Ok(InboundEvent::Notification(event))
            }
            EVENT_SUBSCRIBED => match data {
                Value::String(device_id) => Ok(InboundEvent::Subscribed(SubscriptionAck {
                    device_id,
                })),
                other => parse_payload(name, other).map(InboundEvent::Subscribed),
            },
            EVENT_CONNECTED => {
                let message = match data {
                    Value::String(message) => message,
                    Value::Object(obj) => obj
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    _ => String::new(),
                };
                Ok(InboundEvent::Connected(message))
            }
            other => Ok(InboundEvent::Unknown {
                name: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    SubscribeDevice(String),
    UnsubscribeDevice(String),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::SubscribeDevice(_) => EVENT_SUBSCRIBE_DEVICE,
            OutboundEvent::UnsubscribeDevice(_) => EVENT_UNSUBSCRIBE_DEVICE,
        }
    }

    pub fn into_packet(self, namespace: &str) -> SocketPacket {
        let name = self.name().to_string();
        let device_id = match self {
            OutboundEvent::SubscribeDevice(id) | OutboundEvent::UnsubscribeDevice(id) => id,
        };
        SocketPacket::Event {
            namespace: namespace.to_string(),
            name,
            data: serde_json::json!({ "deviceId": device_id }),
        }
    }

    /// Full Engine.IO frame ready for the transport.
    pub fn encode(self, namespace: &str) -> String {
        EnginePacket::Message(self.into_packet(namespace).encode()).encode()
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> ProtocolResult<T> {
    serde_json::from_value(data).map_err(|e| invalid(event, e.to_string()))
}

fn invalid(event: &str, message: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidPayload {
        event: event.to_string(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_open_packet() {
        let packet = EnginePacket::decode(
            r#"0{"sid":"lv_VI97HAXpY6yYWAAAC","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#,
        )
        .unwrap();

        match packet {
            EnginePacket::Open(handshake) => {
                assert_eq!(handshake.sid, "lv_VI97HAXpY6yYWAAAC");
                assert_eq!(handshake.upgrades, vec!["websocket".to_string()]);
                assert_eq!(handshake.heartbeat_deadline(), Duration::from_secs(45));
            }
            other => panic!("expected open packet, got {:?}", other),
        }
    }

    #[test]
    fn test_engine_control_packets() {
        assert_eq!(EnginePacket::decode("2").unwrap(), EnginePacket::Ping(None));
        assert_eq!(
            EnginePacket::decode("2probe").unwrap(),
            EnginePacket::Ping(Some("probe".to_string()))
        );
        assert_eq!(EnginePacket::Pong(None).encode(), "3");
        assert_eq!(EnginePacket::decode("1").unwrap(), EnginePacket::Close);
        assert_eq!(EnginePacket::decode("6").unwrap(), EnginePacket::Noop);
        assert_eq!(EnginePacket::decode(""), Err(ProtocolError::Empty));
        assert_eq!(
            EnginePacket::decode("9"),
            Err(ProtocolError::UnknownType('9'))
        );
        assert!(matches!(
            EnginePacket::decode("bAQID"),
            Err(ProtocolError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_polling_payload_framing() {
        let payload = "2\u{1e}40/positions,{\"sid\":\"abc\"}\u{1e}6";
        let packets = EnginePacket::decode_payload(payload).unwrap();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0], EnginePacket::Ping(None));
        assert_eq!(
            packets[1],
            EnginePacket::Message("0/positions,{\"sid\":\"abc\"}".to_string())
        );

        let encoded = EnginePacket::encode_payload(&[
            EnginePacket::Pong(None),
            EnginePacket::Message("2/positions,[\"x\"]".to_string()),
        ]);
        assert_eq!(encoded, "3\u{1e}42/positions,[\"x\"]");
    }

    #[test]
    fn test_connect_packet_carries_auth() {
        let packet = SocketPacket::Connect {
            namespace: "/positions".to_string(),
            data: Some(json!({ "token": "secret" })),
        };
        assert_eq!(packet.encode(), r#"0/positions,{"token":"secret"}"#);

        let root = SocketPacket::Connect {
            namespace: "/".to_string(),
            data: None,
        };
        assert_eq!(root.encode(), "0");
    }

    #[test]
    fn test_decode_event_packet() {
        let packet =
            SocketPacket::decode(r#"2/positions,["device:status",{"deviceId":"d1"}]"#).unwrap();
        assert_eq!(
            packet,
            SocketPacket::Event {
                namespace: "/positions".to_string(),
                name: "device:status".to_string(),
                data: json!({ "deviceId": "d1" }),
            }
        );

        let with_ack = SocketPacket::decode(r#"2/positions,17["subscribed","d1"]"#).unwrap();
        assert!(matches!(with_ack, SocketPacket::Event { ref name, .. } if name == "subscribed"));

        let root = SocketPacket::decode(r#"2["hello"]"#).unwrap();
        assert_eq!(root.namespace(), "/");
    }

    #[test]
    fn test_decode_connect_error_variants() {
        let v4 = SocketPacket::decode(r#"4/positions,{"message":"Authentication error"}"#).unwrap();
        assert_eq!(
            v4,
            SocketPacket::ConnectError {
                namespace: "/positions".to_string(),
                message: "Authentication error".to_string(),
            }
        );

        let legacy = SocketPacket::decode(r#"4/positions,"Invalid namespace""#).unwrap();
        assert!(
            matches!(legacy, SocketPacket::ConnectError { ref message, .. } if message == "Invalid namespace")
        );
    }

    #[test]
    fn test_decode_rejects_unsupported_and_malformed() {
        assert!(matches!(
            SocketPacket::decode(r#"51-/positions,["x",{"_placeholder":true,"num":0}]"#),
            Err(ProtocolError::Unsupported { .. })
        ));
        assert!(matches!(
            SocketPacket::decode(r#"2/positions,{"not":"an array"}"#),
            Err(ProtocolError::Malformed { .. })
        ));
        assert!(matches!(
            SocketPacket::decode(r#"2/positions,[42]"#),
            Err(ProtocolError::Malformed { .. })
        ));
        assert!(matches!(
            SocketPacket::decode("2/positions,[oops"),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn test_outbound_subscription_frames() {
        assert_eq!(
            OutboundEvent::SubscribeDevice("d1".to_string()).encode("/positions"),
            r#"42/positions,["subscribe:device",{"deviceId":"d1"}]"#
        );
        assert_eq!(
            OutboundEvent::UnsubscribeDevice("d1".to_string()).encode("/positions"),
            r#"42/positions,["unsubscribe:device",{"deviceId":"d1"}]"#
        );
    }

    #[test]
    fn test_inbound_position_is_validated() {
        let valid = InboundEvent::decode(
            EVENT_POSITION_UPDATE,
            json!({
                "deviceId": "d1",
                "latitude": 18.47,
                "longitude": -69.90,
                "speed": 42,
                "course": 180,
                "altitude": 10,
                "timestamp": "2024-01-01T00:00:00Z"
            }),
        )
        .unwrap();
        assert!(matches!(valid, InboundEvent::PositionUpdate(ref p) if p.speed == 42.0));

        let out_of_range = InboundEvent::decode(
            EVENT_POSITION_UPDATE,
            json!({
                "deviceId": "d1",
                "latitude": 123.0,
                "longitude": 0.0,
                "timestamp": "2024-01-01T00:00:00Z"
            }),
        );
        assert!(matches!(
            out_of_range,
            Err(ProtocolError::InvalidPayload { .. })
        ));

        let wrong_shape = InboundEvent::decode(EVENT_DEVICE_STATUS, json!("online"));
        assert!(matches!(wrong_shape, Err(ProtocolError::InvalidPayload { .. })));
    }

    #[test]
    fn test_inbound_position_accepts_lenient_backend_shapes() {
        let decode = |field: &str, value: Value| {
            let mut payload = json!({
                "deviceId": "d1",
                "latitude": 18.47,
                "longitude": -69.90,
                "speed": 42,
                "course": 180,
                "altitude": 10,
                "timestamp": "2024-01-01T00:00:00Z"
            });
            payload[field] = value;
            match InboundEvent::decode(EVENT_POSITION_UPDATE, payload) {
                Ok(InboundEvent::PositionUpdate(position)) => position,
                other => panic!("{} was not accepted: {:?}", field, other),
            }
        };

        assert_eq!(decode("battery", json!(87.5)).battery, Some(87.5));
        assert_eq!(
            decode("timestamp", json!("2024-01-01T00:00:00")).timestamp,
            "2024-01-01T00:00:00"
        );
        assert_eq!(decode("speed", Value::Null).speed, 0.0);

        let overcharged = InboundEvent::decode(
            EVENT_POSITION_UPDATE,
            json!({
                "deviceId": "d1",
                "latitude": 1.0,
                "longitude": 1.0,
                "battery": 100.5,
                "timestamp": "2024-01-01T00:00:00Z"
            }),
        );
        assert!(matches!(
            overcharged,
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_inbound_batch_drops_only_invalid_elements() {
        let event = InboundEvent::decode(
            EVENT_POSITIONS_BATCH,
            json!([
                { "deviceId": "d1", "latitude": 1.0, "longitude": 1.0, "timestamp": "2024-01-01T00:00:00Z" },
                { "deviceId": "", "latitude": 1.0, "longitude": 1.0, "timestamp": "2024-01-01T00:00:01Z" },
                { "garbage": true },
                { "deviceId": "d2", "latitude": 2.0, "longitude": 2.0, "timestamp": "2024-01-01T00:00:02Z" }
            ]),
        )
        .unwrap();

        match event {
            InboundEvent::PositionsBatch(positions) => {
                let ids: Vec<_> = positions.iter().map(|p| p.device_id.as_str()).collect();
                assert_eq!(ids, vec!["d1", "d2"]);
            }
            other => panic!("expected batch, got {:?}", other),
        }

        assert!(InboundEvent::decode(EVENT_POSITIONS_BATCH, json!({})).is_err());
    }

    #[test]
    fn test_inbound_acknowledgements() {
        assert_eq!(
            InboundEvent::decode(EVENT_SUBSCRIBED, json!({ "deviceId": "d1" })).unwrap(),
            InboundEvent::Subscribed(SubscriptionAck {
                device_id: "d1".to_string()
            })
        );
        assert_eq!(
            InboundEvent::decode(EVENT_SUBSCRIBED, json!("d2")).unwrap(),
            InboundEvent::Subscribed(SubscriptionAck {
                device_id: "d2".to_string()
            })
        );
        assert_eq!(
            InboundEvent::decode(EVENT_CONNECTED, json!({ "message": "welcome" })).unwrap(),
            InboundEvent::Connected("welcome".to_string())
        );
        assert_eq!(
            InboundEvent::decode("trip:started", Value::Null).unwrap(),
            InboundEvent::Unknown {
                name: "trip:started".to_string()
            }
        );
    }
}
