//! Interactive camera discovery.
//!
//! Watches BLE advertisements for Sony cameras (filtered on the Sony
//! manufacturer id) and reports each one once per scan. Discovered device
//! handles are parked in the shared device map so a later association or
//! session start can resolve them without scanning again.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use bluest::{Adapter, Device};
use futures_util::StreamExt;
use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::capabilities::Capabilities;
use crate::core::bluetooth::constants::{MIN_RSSI_THRESHOLD, SONY_MANUFACTURER_ID};
use crate::core::bluetooth::types::DiscoveredCamera;
use crate::utils::extract_mac_address;

pub struct CameraScanner {
    adapter: Adapter,
    devices: Arc<Mutex<HashMap<String, Device>>>,
    capabilities: Capabilities,
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
}

impl CameraScanner {
    pub fn new(
        adapter: Adapter,
        devices: Arc<Mutex<HashMap<String, Device>>>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            adapter,
            devices,
            capabilities,
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
        }
    }

    /// Starts scanning; each camera is reported once through `found`.
    pub async fn start_scan(&mut self, found: mpsc::UnboundedSender<DiscoveredCamera>) -> Result<()> {
        if self.scan_task_handle.is_some() {
            self.stop_scan().await?;
        }

        self.cancel_token = CancellationToken::new();
        let cancel_token = self.cancel_token.clone();
        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let capabilities = self.capabilities;

        let handle = tokio::spawn(async move {
            if let Err(e) =
                Self::scan_task(adapter, devices, capabilities, found, cancel_token).await
            {
                error!("Scan task failed: {e}");
            }
        });
        self.scan_task_handle = Some(handle);

        info!("Camera scan task started");
        Ok(())
    }

    async fn scan_task(
        adapter: Adapter,
        devices: Arc<Mutex<HashMap<String, Device>>>,
        capabilities: Capabilities,
        found: mpsc::UnboundedSender<DiscoveredCamera>,
        cancel_token: CancellationToken,
    ) -> Result<()> {
        info!("Starting bluetooth scan");
        let mut scan_stream = adapter.scan(&[]).await?;
        let mut reported: HashSet<String> = HashSet::new();

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(discovered) => {
                            let is_camera = discovered
                                .adv_data
                                .manufacturer_data
                                .as_ref()
                                .map(|m| m.company_id == SONY_MANUFACTURER_ID)
                                .unwrap_or(false);
                            if !is_camera {
                                continue;
                            }
                            if let Some(rssi) = discovered.rssi {
                                if rssi < MIN_RSSI_THRESHOLD {
                                    debug!("Camera too far away, RSSI {rssi}");
                                    continue;
                                }
                            }
                            Self::register_camera(
                                &devices,
                                capabilities,
                                &found,
                                &mut reported,
                                discovered.device,
                                discovered.rssi,
                            );
                        }
                        None => {
                            info!("Bluetooth scan stream has ended");
                            break;
                        }
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }
        Ok(())
    }

    fn register_camera(
        devices: &Mutex<HashMap<String, Device>>,
        capabilities: Capabilities,
        found: &mpsc::UnboundedSender<DiscoveredCamera>,
        reported: &mut HashSet<String>,
        device: Device,
        rssi: Option<i16>,
    ) {
        let platform_id = device.id().to_string();
        let address = if capabilities.ids_expose_mac {
            extract_mac_address(&platform_id)
        } else {
            None
        };
        let name = device.name().ok();

        // the address is the preferred key; opaque platforms fall back to the id
        let key = address.clone().unwrap_or_else(|| platform_id.clone());
        devices
            .lock()
            .expect("device map poisoned")
            .insert(key.clone(), device);

        if !reported.insert(key) {
            return;
        }

        info!(
            "Found camera - ID: {platform_id}, Address: {:?}, Name: {:?}, RSSI: {:?}",
            address, name, rssi
        );
        let _ = found.send(DiscoveredCamera {
            platform_id,
            address,
            name,
            rssi,
        });
    }

    /// Cancels the scan and waits for the task to wind down.
    pub async fn stop_scan(&mut self) -> Result<()> {
        info!("Stopping camera scan");
        self.cancel_token.cancel();

        if let Some(handle) = self.scan_task_handle.take() {
            if let Err(e) = handle.await {
                if e.is_cancelled() {
                    info!("Scan task was cancelled");
                } else {
                    error!("Scan task finished with an unexpected join error: {e:?}");
                }
            }
        }
        Ok(())
    }
}
