//! Application state management
//! This module wires the shared pieces together: the adapter, the device
//! handle map, the persisted stores and the platform capability table.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use bluest::{Adapter, Device};
use log::info;

use crate::config::SettingsStore;
use crate::core::association::AssociationStore;
use crate::core::bluetooth::capabilities::{self, Capabilities};
use crate::core::bluetooth::link::BluestLinkFactory;
use crate::core::bluetooth::scanner::CameraScanner;
use crate::error::BridgeError;

pub struct AppState {
    pub adapter: Adapter,
    pub capabilities: Capabilities,
    /// Device handles by canonical address, shared between the scanner, the
    /// presence watcher and the link factory
    pub devices: Arc<Mutex<HashMap<String, Device>>>,
    pub settings: Arc<SettingsStore>,
    pub associations: Arc<AssociationStore>,
}

impl AppState {
    /// Initializes the adapter and loads the persisted stores from
    /// `config_dir`.
    pub async fn new(config_dir: &Path) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or(BridgeError::AdapterUnavailable)?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available");

        let settings = Arc::new(SettingsStore::load(config_dir).await?);
        let associations = Arc::new(AssociationStore::load(config_dir).await?);

        Ok(Self {
            adapter,
            capabilities: capabilities::resolve(),
            devices: Arc::new(Mutex::new(HashMap::new())),
            settings,
            associations,
        })
    }

    pub fn link_factory(&self) -> BluestLinkFactory {
        BluestLinkFactory::new(self.adapter.clone(), self.devices.clone())
    }

    pub fn scanner(&self) -> CameraScanner {
        CameraScanner::new(self.adapter.clone(), self.devices.clone(), self.capabilities)
    }
}
