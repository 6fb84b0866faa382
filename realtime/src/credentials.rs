use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

use crate::transport::{RealtimeError, RealtimeResult};

/// Key under which the bearer token is stored.
pub const AUTH_TOKEN_KEY: &str = "authToken";

/// Key-value store holding the bearer credential used to authenticate the channel.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_item(&self, key: &str) -> RealtimeResult<Option<String>>;

    async fn set_item(&self, key: &str, value: &str) -> RealtimeResult<()>;

    async fn delete_item(&self, key: &str) -> RealtimeResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    items: RwLock<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let mut items = HashMap::new();
        items.insert(AUTH_TOKEN_KEY.to_string(), token.into());
        Self {
            items: RwLock::new(items),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get_item(&self, key: &str) -> RealtimeResult<Option<String>> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> RealtimeResult<()> {
        self.items
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_item(&self, key: &str) -> RealtimeResult<()> {
        self.items.write().await.remove(key);
        Ok(())
    }
}

/// Credential store persisted as a flat JSON object on disk.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> RealtimeResult<HashMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(HashMap::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(RealtimeError::Credentials {
                message: format!("Failed to read {}: {}", self.path.display(), e),
            }),
        }
    }

    async fn save(&self, items: &HashMap<String, String>) -> RealtimeResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| RealtimeError::Credentials {
                        message: format!("Failed to create {}: {}", parent.display(), e),
                    })?;
            }
        }

        let contents = serde_json::to_string_pretty(items)?;
        let write_error = |e: std::io::Error| RealtimeError::Credentials {
            message: format!("Failed to write {}: {}", self.path.display(), e),
        };

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&self.path).await.map_err(write_error)?;

        // The mode above only applies to newly created files.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(write_error)?;
        }

        file.write_all(contents.as_bytes())
            .await
            .map_err(write_error)?;
        file.flush().await.map_err(write_error)
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get_item(&self, key: &str) -> RealtimeResult<Option<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(key))
    }

    async fn set_item(&self, key: &str, value: &str) -> RealtimeResult<()> {
        let _guard = self.lock.lock().await;
        let mut items = self.load().await?;
        items.insert(key.to_string(), value.to_string());
        debug!("Storing credential '{}' in {}", key, self.path.display());
        self.save(&items).await
    }

    async fn delete_item(&self, key: &str) -> RealtimeResult<()> {
        let _guard = self.lock.lock().await;
        let mut items = self.load().await?;
        if items.remove(key).is_some() {
            debug!("Removing credential '{}' from {}", key, self.path.display());
            self.save(&items).await?;
        }
        Ok(())
    }
}
