//! Persisted association store.
//!
//! The app-level list of remembered cameras. Each record carries a small
//! numeric association id next to the address because presence events may be
//! keyed by either; the address stays the natural key.

use std::path::{Path, PathBuf};

use log::{info, warn};
use tokio::fs;
use tokio::sync::RwLock;

use crate::core::bluetooth::types::{DeviceIdentity, PairingState};
use crate::error::Result;
use crate::utils::{ensure_directory_exists, normalize_address};

const ASSOCIATIONS_FILE_NAME: &str = "associations.json";

pub struct AssociationStore {
    path: PathBuf,
    devices: RwLock<Vec<DeviceIdentity>>,
}

impl AssociationStore {
    /// Loads the store from `dir`, starting empty when no file exists yet.
    pub async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(ASSOCIATIONS_FILE_NAME);

        let devices = if path.exists() {
            let json = fs::read_to_string(&path).await?;
            let devices: Vec<DeviceIdentity> = serde_json::from_str(&json)?;
            info!("Loaded {} associated device(s) from {:?}", devices.len(), path);
            devices
        } else {
            warn!("Association file not found at {:?}, starting empty", path);
            Vec::new()
        };

        Ok(Self {
            path,
            devices: RwLock::new(devices),
        })
    }

    pub async fn list(&self) -> Vec<DeviceIdentity> {
        self.devices.read().await.clone()
    }

    pub async fn find_by_address(&self, address: &str) -> Option<DeviceIdentity> {
        let Ok(address) = normalize_address(address) else {
            return None;
        };
        self.devices
            .read()
            .await
            .iter()
            .find(|d| d.address == address)
            .cloned()
    }

    pub async fn find_by_id(&self, id: i32) -> Option<DeviceIdentity> {
        self.devices
            .read()
            .await
            .iter()
            .find(|d| d.id == Some(id))
            .cloned()
    }

    /// Remembers a camera. Re-associating an existing address refreshes the
    /// record but keeps its association id.
    pub async fn associate(&self, identity: DeviceIdentity) -> Result<DeviceIdentity> {
        let address = normalize_address(&identity.address)?;

        let stored = {
            let mut devices = self.devices.write().await;

            let stored = match devices.iter_mut().find(|d| d.address == address) {
                Some(existing) => {
                    existing.name = identity.name;
                    existing.pairing = identity.pairing;
                    existing.clone()
                }
                None => {
                    let next_id = devices
                        .iter()
                        .filter_map(|d| d.id)
                        .max()
                        .unwrap_or(0)
                        + 1;
                    let record = DeviceIdentity {
                        id: Some(next_id),
                        address,
                        name: identity.name,
                        pairing: identity.pairing,
                    };
                    devices.push(record.clone());
                    record
                }
            };
            self.save(&devices).await?;
            stored
        };

        info!("Associated device: {} ({})", stored.name, stored.address);
        Ok(stored)
    }

    /// Forgets a camera. Returns false when the address was not associated.
    pub async fn disassociate(&self, address: &str) -> Result<bool> {
        let address = normalize_address(address)?;
        let mut devices = self.devices.write().await;

        let before = devices.len();
        devices.retain(|d| d.address != address);
        let removed = devices.len() != before;
        if removed {
            info!("Disassociated device: {address}");
            self.save(&devices).await?;
        }
        Ok(removed)
    }

    /// Updates the recorded bonding state of an associated camera.
    pub async fn set_pairing(&self, address: &str, pairing: PairingState) -> Result<()> {
        let address = normalize_address(address)?;
        let mut devices = self.devices.write().await;
        if let Some(device) = devices.iter_mut().find(|d| d.address == address) {
            device.pairing = pairing;
            self.save(&devices).await?;
        }
        Ok(())
    }

    async fn save(&self, devices: &[DeviceIdentity]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            let _ = ensure_directory_exists(parent).await;
        }
        let json = serde_json::to_string_pretty(devices)?;
        fs::write(&self.path, json).await?;
        Ok(())
    }
}
