//! Persisted application settings.
//!
//! A single JSON file in the platform config directory: the global enable
//! switch, the timezone used for the packet's offset fields, the optional
//! fixed location, and the per-camera flags. Only the settings surface
//! writes here; everything else reads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::utils::{ensure_directory_exists, normalize_address};

const SETTINGS_FILE_NAME: &str = "settings.json";

/// Per-camera flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// May this camera run a session at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Hold the session open permanently instead of following presence
    /// events. Workaround for hosts whose presence signaling is unreliable.
    #[serde(default)]
    pub keep_alive: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            keep_alive: false,
        }
    }
}

/// A fixed position for hosts without positioning hardware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticLocationConfig {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_accuracy")]
    pub accuracy_m: f64,
}

fn default_accuracy() -> f64 {
    25.0
}

fn default_true() -> bool {
    true
}

fn default_timezone() -> Tz {
    chrono_tz::UTC
}

/// The complete persisted settings document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Master switch; no session starts while this is off
    #[serde(default = "default_true")]
    pub app_enabled: bool,
    /// Timezone for the packet's offset fields, by IANA name
    #[serde(default = "default_timezone", with = "timezone_serde")]
    pub timezone: Tz,
    /// Fixed location fed to the camera when no other provider is wired in
    #[serde(default)]
    pub static_location: Option<StaticLocationConfig>,
    /// Per-camera flags, keyed by canonical address
    #[serde(default)]
    pub devices: HashMap<String, DeviceSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_enabled: true,
            timezone: default_timezone(),
            static_location: None,
            devices: HashMap::new(),
        }
    }
}

/// Shared, persistent settings handle.
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
}

impl SettingsStore {
    /// Loads the settings from `dir`, falling back to defaults when the
    /// file does not exist yet.
    pub async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(SETTINGS_FILE_NAME);

        let settings = if path.exists() {
            let json = fs::read_to_string(&path).await?;
            let settings = serde_json::from_str(&json)?;
            info!("Settings loaded from {:?}", path);
            settings
        } else {
            warn!("Settings file not found at {:?}, using defaults", path);
            Settings::default()
        };

        Ok(Self {
            path,
            current: RwLock::new(settings),
        })
    }

    pub async fn snapshot(&self) -> Settings {
        self.current.read().await.clone()
    }

    pub async fn app_enabled(&self) -> bool {
        self.current.read().await.app_enabled
    }

    pub async fn timezone(&self) -> Tz {
        self.current.read().await.timezone
    }

    /// Flags for one camera; unknown addresses get the defaults.
    pub async fn device(&self, address: &str) -> DeviceSettings {
        self.current
            .read()
            .await
            .devices
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn set_app_enabled(&self, enabled: bool) -> Result<()> {
        let mut current = self.current.write().await;
        current.app_enabled = enabled;
        self.save(&current).await
    }

    pub async fn set_timezone(&self, timezone: Tz) -> Result<()> {
        let mut current = self.current.write().await;
        current.timezone = timezone;
        self.save(&current).await
    }

    /// Mutates one camera's flags and persists the result.
    pub async fn update_device<F>(&self, address: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut DeviceSettings),
    {
        let address = normalize_address(address)?;
        let mut current = self.current.write().await;
        update(current.devices.entry(address).or_default());
        self.save(&current).await
    }

    /// Drops a camera's flags, used when it is disassociated.
    pub async fn remove_device(&self, address: &str) -> Result<()> {
        let address = normalize_address(address)?;
        let mut current = self.current.write().await;
        if current.devices.remove(&address).is_some() {
            self.save(&current).await?;
        }
        Ok(())
    }

    async fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            let _ = ensure_directory_exists(parent).await;
        }
        let json = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, json).await?;
        Ok(())
    }
}

mod timezone_serde {
    use chrono_tz::Tz;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(tz.name())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Tz, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
