//! Configuration store
//!
//! ## Responsibilities
//!
//! - Load and persist the daemon configuration (YAML)
//! - Hand out immutable snapshots to the many components that read it
//!
//! Reads are `Arc<Config>` snapshots; writes replace the whole record under
//! a lock. Nothing mutates nested fields in place.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Default configuration file location
pub const CONFIG_FILE: &str = "/mutable/teslausb/config.yaml";

/// How clips leave the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveMethod {
    Nfs,
    Cifs,
}

impl Default for ArchiveMethod {
    fn default() -> Self {
        Self::Nfs
    }
}

/// How the car is kept awake during an archive pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepAwakeMethod {
    Ble,
    Webhook,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NfsConfig {
    pub server: String,
    pub share: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CifsConfig {
    pub server: String,
    pub share: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub method: ArchiveMethod,
    /// Also archive RecentClips (normally only Saved/Sentry are copied)
    pub recent_clips: bool,
    pub reserve_percent: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAwakeConfig {
    pub method: Option<KeepAwakeMethod>,
    pub vin: String,
    pub webhook_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub webhook_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureConfig {
    pub warning_celsius: f64,
    pub caution_celsius: f64,
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            warning_celsius: 70.0,
            caution_celsius: 60.0,
        }
    }
}

/// Daemon configuration. Every section defaults, so an empty file loads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub nfs: NfsConfig,
    pub cifs: CifsConfig,
    pub archive: ArchiveConfig,
    pub keep_awake: KeepAwakeConfig,
    pub notifications: NotificationsConfig,
    pub temperature: TemperatureConfig,
}

/// ConfigStore instance
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<Config>>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(Arc::new(Config::default())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current configuration snapshot
    pub async fn get(&self) -> Arc<Config> {
        self.current.read().await.clone()
    }

    /// Load the configuration file into the store.
    ///
    /// An empty file yields the default configuration; a missing file is an
    /// error so the caller can decide whether to seed one.
    pub async fn load(&self) -> Result<Arc<Config>> {
        let data = tokio::fs::read_to_string(&self.path).await?;
        let config: Config = if data.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(&data)?
        };
        let snapshot = Arc::new(config);
        *self.current.write().await = snapshot.clone();
        Ok(snapshot)
    }

    /// Load the configuration, seeding a default file when none exists.
    pub async fn load_or_init(&self) -> Result<Arc<Config>> {
        if !self.path.exists() {
            tracing::info!(path = %self.path.display(), "No configuration found, writing defaults");
            self.save(Config::default()).await?;
        }
        self.load().await
    }

    /// Replace the whole configuration record and persist it.
    pub async fn save(&self, config: Config) -> Result<()> {
        let data = serde_yaml::to_string(&config)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, data).await?;
        *self.current.write().await = Arc::new(config);
        Ok(())
    }
}
