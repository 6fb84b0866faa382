use realtime::config::BASE_URL_ENV;
use realtime::RealtimeConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const CREDENTIALS_FILE: &str = "credentials.json";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type SettingsResult<T> = Result<T, SettingsError>;

/// Contents of the `tracker` TOML file.
///
/// ```toml
/// devices = ["truck-7"]
///
/// [realtime]
/// base_url = "https://fleet.example.com"
///
/// [realtime.reconnection]
/// max_attempts = 10
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<PathBuf>,
    /// Devices `watch` subscribes to when none are given on the command line.
    pub devices: Vec<String>,
    pub realtime: RealtimeConfig,
}

impl Settings {
    /// Reads the settings file if one is given, then applies
    /// `TRACKER_SOCKET_URL` on top.
    pub fn load(path: Option<&Path>) -> SettingsResult<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> SettingsResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(BASE_URL_ENV) {
            if !url.trim().is_empty() {
                self.realtime.base_url = url.trim().to_string();
            }
        }
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        if let Some(base_url) = base_url {
            self.realtime.base_url = base_url;
        }
        self
    }

    pub fn validate(&self) -> SettingsResult<()> {
        if self.devices.iter().any(|device| device.trim().is_empty()) {
            return Err(SettingsError::Invalid(
                "Device ids cannot be empty".to_string(),
            ));
        }
        self.realtime.validate().map_err(SettingsError::Invalid)
    }

    /// Credential file to use: the command line wins over the settings file,
    /// which wins over the per-user default.
    pub fn credentials_path(&self, cli: Option<PathBuf>) -> PathBuf {
        cli.or_else(|| self.credentials.clone())
            .unwrap_or_else(default_credentials_path)
    }

    pub fn to_toml(&self) -> SettingsResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn default_credentials_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home)
            .join(".config")
            .join("fleet-tracker")
            .join(CREDENTIALS_FILE),
        None => PathBuf::from(CREDENTIALS_FILE),
    }
}
