use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// A single telemetry sample reported by a tracked device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionUpdate {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Ground speed in km/h.
    #[serde(default, deserialize_with = "null_as_zero")]
    pub speed: f64,
    /// Heading in degrees, 0 to 360.
    #[serde(default, deserialize_with = "null_as_zero")]
    pub course: f64,
    /// Altitude in meters.
    #[serde(default, deserialize_with = "null_as_zero")]
    pub altitude: f64,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Battery level in percent.
    pub battery: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satellites: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignition: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion: Option<bool>,
}

impl PositionUpdate {
    pub fn new(
        device_id: impl Into<String>,
        latitude: f64,
        longitude: f64,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            latitude,
            longitude,
            speed: 0.0,
            course: 0.0,
            altitude: 0.0,
            timestamp: timestamp.into(),
            address: None,
            battery: None,
            satellites: None,
            ignition: None,
            motion: None,
        }
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_course(mut self, course: f64) -> Self {
        self.course = course;
        self
    }

    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = altitude;
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_battery(mut self, battery: f64) -> Self {
        self.battery = Some(battery);
        self
    }

    /// Parsed timestamp. Timestamps without an offset are taken as UTC.
    pub fn recorded_at(&self) -> Option<DateTime<FixedOffset>> {
        parse_timestamp(&self.timestamp).ok()
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_device_id(&self.device_id)?;
        validate_timestamp(&self.timestamp)?;

        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(format!("Latitude out of range: {}", self.latitude));
        }

        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(format!("Longitude out of range: {}", self.longitude));
        }

        if !self.speed.is_finite() || self.speed < 0.0 {
            return Err(format!("Speed must be a non-negative number: {}", self.speed));
        }

        if !self.course.is_finite() || !(0.0..=360.0).contains(&self.course) {
            return Err(format!("Course must be between 0 and 360: {}", self.course));
        }

        if !self.altitude.is_finite() {
            return Err("Altitude must be a finite number".to_string());
        }

        if let Some(battery) = self.battery {
            if !battery.is_finite() || !(0.0..=100.0).contains(&battery) {
                return Err(format!("Battery level must be between 0 and 100: {}", battery));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Online,
    Offline,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Online => write!(f, "online"),
            DeviceState::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_id: String,
    pub status: DeviceState,
    pub timestamp: String,
}

impl DeviceStatus {
    pub fn new(
        device_id: impl Into<String>,
        status: DeviceState,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            status,
            timestamp: timestamp.into(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_device_id(&self.device_id)?;
        validate_timestamp(&self.timestamp)
    }
}

/// Free-form alert raised by the backend for a device (geofence, overspeed, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventNotification {
    #[serde(rename = "type")]
    pub event_type: String,
    pub device_id: String,
    pub message: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl EventNotification {
    pub fn new(
        event_type: impl Into<String>,
        device_id: impl Into<String>,
        message: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            device_id: device_id.into(),
            message: message.into(),
            timestamp: timestamp.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.event_type.is_empty() {
            return Err("Event type cannot be empty".to_string());
        }
        validate_device_id(&self.device_id)?;
        validate_timestamp(&self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionAck {
    pub device_id: String,
}

fn validate_device_id(device_id: &str) -> Result<(), String> {
    if device_id.trim().is_empty() {
        return Err("Device identifier cannot be empty".to_string());
    }
    Ok(())
}

fn validate_timestamp(timestamp: &str) -> Result<(), String> {
    parse_timestamp(timestamp).map(|_| ())
}

/// Accepts RFC 3339 and ISO-8601 local date-times (`2024-01-01T00:00:00`,
/// optionally with fractional seconds).
fn parse_timestamp(timestamp: &str) -> Result<DateTime<FixedOffset>, String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(timestamp) {
        return Ok(parsed);
    }

    let naive = NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|e| format!("Invalid timestamp '{}': {}", timestamp, e))?;
    let utc = FixedOffset::east_opt(0).ok_or_else(|| "Invalid UTC offset".to_string())?;
    Ok(utc.from_utc_datetime(&naive))
}

/// Explicit `null` counts as absent for the defaulted kinematic fields.
fn null_as_zero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or_default())
}
