use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::credentials::AUTH_TOKEN_KEY;
use crate::transport::TransportKind;

pub const DEFAULT_BASE_URL: &str = "http://localhost:3001";
pub const BASE_URL_ENV: &str = "TRACKER_SOCKET_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub base_url: String,
    pub namespace: String,
    pub socket_path: String,
    /// Transports to try, in order of preference.
    pub transports: Vec<TransportKind>,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    pub credential_key: String,
    pub reconnection: ReconnectionPolicy,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            namespace: "/positions".to_string(),
            socket_path: "/socket.io/".to_string(),
            transports: vec![TransportKind::WebSocket, TransportKind::Polling],
            connect_timeout: Duration::from_secs(20),
            credential_key: AUTH_TOKEN_KEY.to_string(),
            reconnection: ReconnectionPolicy::default(),
        }
    }
}

impl RealtimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default configuration with the base URL taken from `TRACKER_SOCKET_URL`.
    pub fn from_env() -> Self {
        match std::env::var(BASE_URL_ENV) {
            Ok(url) if !url.trim().is_empty() => Self::default().with_base_url(url.trim()),
            _ => Self::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_transports(mut self, transports: Vec<TransportKind>) -> Self {
        self.transports = transports;
        self
    }

    pub fn with_reconnection(mut self, reconnection: ReconnectionPolicy) -> Self {
        self.reconnection = reconnection;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_credential_key(mut self, key: impl Into<String>) -> Self {
        self.credential_key = key.into();
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_url.is_empty() {
            return Err("Base URL cannot be empty".to_string());
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err("Base URL must start with http:// or https://".to_string());
        }

        if !self.namespace.starts_with('/') {
            return Err("Namespace must start with '/'".to_string());
        }

        if !self.socket_path.starts_with('/') {
            return Err("Socket path must start with '/'".to_string());
        }

        if self.transports.is_empty() {
            return Err("At least one transport must be enabled".to_string());
        }

        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be greater than 0".to_string());
        }

        if self.credential_key.is_empty() {
            return Err("Credential key cannot be empty".to_string());
        }

        self.reconnection.validate()
    }
}

/// Automatic reconnection settings.
///
/// Delays grow exponentially from `base_delay` and are randomized by
/// `randomization_factor` in both directions. The result always stays within
/// `base_delay..=max_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub randomization_factor: f64,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            randomization_factor: 0.5,
        }
    }
}

impl ReconnectionPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn with_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_randomization(mut self, factor: f64) -> Self {
        self.randomization_factor = factor;
        self
    }

    /// Delay before reconnection attempt number `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt.min(16)));

        let delay = if self.randomization_factor > 0.0 {
            let mut rng = rand::thread_rng();
            let deviation = exponential.as_millis() as f64 * self.randomization_factor;
            let offset = rng.gen_range(-deviation..=deviation);
            Duration::from_millis((exponential.as_millis() as f64 + offset).max(0.0) as u64)
        } else {
            exponential
        };

        delay.max(self.base_delay).min(self.max_delay)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return Err("Randomization factor must be between 0.0 and 1.0".to_string());
        }

        if self.max_delay < self.base_delay {
            return Err("Max reconnection delay must not be below the base delay".to_string());
        }

        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
