//! GATT characteristic I/O adapter.
//!
//! The session state machine never touches `bluest` directly. It issues
//! requests through [`GattRequests`] and receives every completion as a
//! [`SessionEvent`] on its event channel, mirroring how the underlying GATT
//! stacks report results through callbacks. The production implementation
//! here and the recording mock used by the tests are interchangeable behind
//! the same contract, picked at composition time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bluest::{Adapter, Characteristic, Device, Uuid};
use log::{error, info};
use tokio::sync::mpsc;

use crate::core::bluetooth::constants::UUID_CAMERA_SERVICE;
use crate::error::{BridgeError, Result};
use crate::utils::normalize_address;

/// Outcome of a single GATT operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Failure(String),
}

impl GattStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, GattStatus::Success)
    }

    fn of<T>(result: &std::result::Result<T, bluest::Error>) -> Self {
        match result {
            Ok(_) => GattStatus::Success,
            Err(e) => GattStatus::Failure(e.to_string()),
        }
    }
}

/// Completion events delivered to the session. Callbacks for one link are
/// consumed by a single task, so ordering follows the order the operations
/// finished in.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionChanged {
        status: GattStatus,
    },
    ServicesDiscovered {
        status: GattStatus,
        characteristics: Vec<Uuid>,
    },
    CharacteristicWritten {
        characteristic: Uuid,
        status: GattStatus,
    },
    CharacteristicRead {
        characteristic: Uuid,
        status: GattStatus,
        value: Vec<u8>,
    },
}

/// Request side of the adapter. All operations are asynchronous: the return
/// value only signals whether the request could be issued at all, the
/// outcome arrives later as a [`SessionEvent`].
pub trait GattRequests: Send {
    /// Initiate a connection. Completion: [`SessionEvent::ConnectionChanged`].
    fn request_connect(&self);

    /// Discover the camera service and its characteristics.
    /// Completion: [`SessionEvent::ServicesDiscovered`].
    fn request_discover(&self);

    /// Write a value to a discovered characteristic. Returns false when the
    /// characteristic is unknown on this link.
    /// Completion: [`SessionEvent::CharacteristicWritten`].
    fn request_write(&self, characteristic: Uuid, value: Vec<u8>) -> bool;

    /// Read a discovered characteristic. Returns false when the
    /// characteristic is unknown on this link.
    /// Completion: [`SessionEvent::CharacteristicRead`].
    fn request_read(&self, characteristic: Uuid) -> bool;

    /// Disconnect and release the underlying connection. No completion
    /// event; the link must not be used afterwards.
    fn close(&self);
}

/// Creates links for a device address. The production factory resolves
/// addresses against the devices seen by the scanner; tests hand out mocks.
pub trait LinkFactory {
    type Link: GattRequests;

    fn open(&self, address: &str, events: mpsc::UnboundedSender<SessionEvent>)
    -> Result<Self::Link>;
}

/// The `bluest`-backed link. Each request spawns a task that performs the
/// operation and posts its completion to the session's event channel.
pub struct BluestLink {
    adapter: Adapter,
    device: Device,
    characteristics: Arc<Mutex<HashMap<Uuid, Characteristic>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl BluestLink {
    pub fn new(adapter: Adapter, device: Device, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            adapter,
            device,
            characteristics: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    async fn discover(
        device: &Device,
        characteristics: &Mutex<HashMap<Uuid, Characteristic>>,
    ) -> std::result::Result<Vec<Uuid>, String> {
        let services = device.services().await.map_err(|e| e.to_string())?;
        let camera_service = services
            .iter()
            .find(|s| s.uuid() == UUID_CAMERA_SERVICE)
            .cloned();

        let Some(camera_service) = camera_service else {
            for service in &services {
                info!("Available service: {}", service.uuid());
            }
            return Err(format!("Camera service not found: {UUID_CAMERA_SERVICE}"));
        };

        let mut found = Vec::new();
        let mut map = HashMap::new();
        for characteristic in camera_service
            .characteristics()
            .await
            .map_err(|e| e.to_string())?
        {
            let uuid = characteristic.uuid();
            found.push(uuid);
            map.insert(uuid, characteristic);
        }
        *characteristics.lock().expect("characteristic map poisoned") = map;
        Ok(found)
    }
}

impl GattRequests for BluestLink {
    fn request_connect(&self) {
        let adapter = self.adapter.clone();
        let device = self.device.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let status = if device.is_connected().await {
                info!("Device already connected");
                GattStatus::Success
            } else {
                info!("Initiating connection to {}", device.id());
                GattStatus::of(&adapter.connect_device(&device).await)
            };
            let _ = events.send(SessionEvent::ConnectionChanged { status });
        });
    }

    fn request_discover(&self) {
        let device = self.device.clone();
        let characteristics = self.characteristics.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let (status, found) = match Self::discover(&device, &characteristics).await {
                Ok(found) => (GattStatus::Success, found),
                Err(message) => (GattStatus::Failure(message), Vec::new()),
            };
            let _ = events.send(SessionEvent::ServicesDiscovered {
                status,
                characteristics: found,
            });
        });
    }

    fn request_write(&self, characteristic: Uuid, value: Vec<u8>) -> bool {
        let handle = {
            let map = self.characteristics.lock().expect("characteristic map poisoned");
            map.get(&characteristic).cloned()
        };
        let Some(handle) = handle else {
            return false;
        };

        let events = self.events.clone();
        tokio::spawn(async move {
            let status = GattStatus::of(&handle.write(&value).await);
            let _ = events.send(SessionEvent::CharacteristicWritten {
                characteristic,
                status,
            });
        });
        true
    }

    fn request_read(&self, characteristic: Uuid) -> bool {
        let handle = {
            let map = self.characteristics.lock().expect("characteristic map poisoned");
            map.get(&characteristic).cloned()
        };
        let Some(handle) = handle else {
            return false;
        };

        let events = self.events.clone();
        tokio::spawn(async move {
            let (status, value) = match handle.read().await {
                Ok(value) => (GattStatus::Success, value),
                Err(e) => (GattStatus::Failure(e.to_string()), Vec::new()),
            };
            let _ = events.send(SessionEvent::CharacteristicRead {
                characteristic,
                status,
                value,
            });
        });
        true
    }

    fn close(&self) {
        let adapter = self.adapter.clone();
        let device = self.device.clone();

        tokio::spawn(async move {
            if device.is_connected().await {
                info!("Disconnecting from device {}", device.id());
                if let Err(e) = adapter.disconnect_device(&device).await {
                    error!("Failed to disconnect: {e}");
                }
            }
        });
    }
}

/// Resolves addresses to [`BluestLink`]s through the device handles the
/// scanner has collected.
#[derive(Clone)]
pub struct BluestLinkFactory {
    adapter: Adapter,
    devices: Arc<Mutex<HashMap<String, Device>>>,
}

impl BluestLinkFactory {
    pub fn new(adapter: Adapter, devices: Arc<Mutex<HashMap<String, Device>>>) -> Self {
        Self { adapter, devices }
    }
}

impl LinkFactory for BluestLinkFactory {
    type Link = BluestLink;

    fn open(
        &self,
        address: &str,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self::Link> {
        let address = normalize_address(address)?;
        let device = {
            let devices = self.devices.lock().expect("device map poisoned");
            devices.get(&address).cloned()
        };
        let device = device.ok_or_else(|| BridgeError::DeviceNotFound(address.clone()))?;
        Ok(BluestLink::new(self.adapter.clone(), device, events))
    }
}
