//! Clock device settings, persisted as JSON.
//!
//! Unlike the static TOML config, these are runtime-mutable through the API
//! (the setup wizard and the settings screen). Every mutation is written to
//! disk before the call returns; a corrupt or missing file loads as factory
//! defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

/// Physical clock hardware variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClockModel {
    #[default]
    Mini,
    #[serde(rename = "XL")]
    Xl,
}

/// Runtime-mutable device configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClockConfig {
    #[serde(default)]
    pub model: ClockModel,
    /// Whether the initial setup wizard has been completed.
    #[serde(default)]
    pub setup: bool,
    #[serde(default)]
    pub wallmounted: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub hostname: Option<String>,
    /// IANA timezone name, e.g. `Europe/Vienna`.
    #[serde(default)]
    pub timezone: Option<String>,
}

/// Owner of the current [`ClockConfig`], with synchronous persistence.
pub struct ClockSettings {
    path: PathBuf,
    current: RwLock<ClockConfig>,
}

impl ClockSettings {
    /// Load settings from disk; absent or corrupt files yield defaults.
    pub async fn load(path: PathBuf) -> Self {
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(config) => config,
                Err(e) => {
                    warn!("ignoring corrupt clock settings {}: {e}", path.display());
                    ClockConfig::default()
                }
            },
            Err(_) => ClockConfig::default(),
        };
        Self {
            path,
            current: RwLock::new(current),
        }
    }

    pub async fn get(&self) -> ClockConfig {
        self.current.read().await.clone()
    }

    /// Replace the whole configuration and persist it.
    pub async fn replace(&self, config: ClockConfig) {
        let mut current = self.current.write().await;
        *current = config;
        self.persist(&current).await;
    }

    pub async fn set_debug(&self, debug: bool) {
        let mut current = self.current.write().await;
        current.debug = debug;
        self.persist(&current).await;
    }

    pub async fn set_setup_complete(&self, setup: bool) {
        let mut current = self.current.write().await;
        current.setup = setup;
        self.persist(&current).await;
    }

    pub async fn set_hostname(&self, hostname: String) {
        let mut current = self.current.write().await;
        current.hostname = Some(hostname);
        self.persist(&current).await;
    }

    pub async fn set_timezone(&self, timezone: String) {
        let mut current = self.current.write().await;
        current.timezone = Some(timezone);
        self.persist(&current).await;
    }

    /// Back to factory defaults (also persisted).
    pub async fn reset(&self) {
        let mut current = self.current.write().await;
        *current = ClockConfig::default();
        self.persist(&current).await;
    }

    /// Write-through. A failing disk degrades to in-memory settings.
    async fn persist(&self, config: &ClockConfig) {
        match serde_json::to_vec_pretty(config) {
            Ok(bytes) => {
                if let Some(parent) = self.path.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                if let Err(e) = tokio::fs::write(&self.path, bytes).await {
                    warn!("failed to persist clock settings {}: {e}", self.path.display());
                }
            }
            Err(e) => warn!("failed to serialize clock settings: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_when_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ClockSettings::load(dir.path().join("clock.json")).await;
        let config = settings.get().await;
        assert_eq!(config.model, ClockModel::Mini);
        assert!(!config.setup);
        assert!(!config.debug);
    }

    #[tokio::test]
    async fn defaults_when_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clock.json");
        tokio::fs::write(&path, b"]]][[[").await.unwrap();
        let settings = ClockSettings::load(path).await;
        assert_eq!(settings.get().await.model, ClockModel::Mini);
    }

    #[tokio::test]
    async fn mutations_are_persisted_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clock.json");

        let settings = ClockSettings::load(path.clone()).await;
        settings.set_debug(true).await;
        settings.set_timezone("Europe/Vienna".to_string()).await;
        settings
            .replace(ClockConfig {
                model: ClockModel::Xl,
                setup: true,
                wallmounted: true,
                debug: true,
                hostname: Some("openclock".to_string()),
                timezone: Some("Europe/Vienna".to_string()),
            })
            .await;

        let reloaded = ClockSettings::load(path).await;
        let config = reloaded.get().await;
        assert_eq!(config.model, ClockModel::Xl);
        assert!(config.setup);
        assert_eq!(config.hostname.as_deref(), Some("openclock"));
    }

    #[test]
    fn model_serializes_with_hardware_names() {
        assert_eq!(
            serde_json::to_string(&ClockModel::Xl).unwrap(),
            "\"XL\"".to_string()
        );
        assert_eq!(
            serde_json::to_string(&ClockModel::Mini).unwrap(),
            "\"Mini\"".to_string()
        );
    }
}
