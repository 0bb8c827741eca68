//! Presence-triggered lifecycle control.
//!
//! The watcher turns raw advertisement sightings into appeared/disappeared
//! events for associated cameras; the controller gates those events on the
//! persisted settings and drives the location sender service. Disappearance
//! signaling is unreliable on some hosts (events flap, or never fire before
//! the process is torn down), so stops always go through the service's
//! cancelable graceful-shutdown path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bluest::{Adapter, Device};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SettingsStore;
use crate::core::association::AssociationStore;
use crate::core::bluetooth::capabilities::Capabilities;
use crate::core::bluetooth::constants::{PRESENCE_SWEEP_INTERVAL_SECS, PRESENCE_TIMEOUT_SECS};
use crate::core::bluetooth::session::StartMode;
use crate::core::service::ServiceCommand;
use crate::utils::{extract_mac_address, normalize_address};

/// How a presence event identifies the camera. Either shape may arrive;
/// the controller normalizes both to the canonical address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKey {
    Address(String),
    AssociationId(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Appeared(DeviceKey),
    Disappeared(DeviceKey),
}

/// Watches advertisements for associated cameras and reports presence
/// transitions.
pub struct PresenceWatcher {
    adapter: Adapter,
    associations: Arc<AssociationStore>,
    capabilities: Capabilities,
    devices: Arc<Mutex<HashMap<String, Device>>>,
    cancel_token: CancellationToken,
}

impl PresenceWatcher {
    pub fn new(
        adapter: Adapter,
        associations: Arc<AssociationStore>,
        capabilities: Capabilities,
        devices: Arc<Mutex<HashMap<String, Device>>>,
    ) -> Self {
        Self {
            adapter,
            associations,
            capabilities,
            devices,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Spawns the watch task. Events flow through `events` until the token
    /// is cancelled or the scan stream ends.
    pub fn spawn(self, events: mpsc::UnboundedSender<PresenceEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.watch(events).await {
                error!("Presence watcher failed: {e}");
            }
        })
    }

    async fn watch(&self, events: mpsc::UnboundedSender<PresenceEvent>) -> anyhow::Result<()> {
        let mut last_seen: HashMap<String, Instant> = HashMap::new();

        // cameras that are connected when we come up count as present
        if let Ok(connected) = self.adapter.connected_devices().await {
            for device in connected {
                if let Some(address) = self.match_associated(&device).await {
                    self.register(&device, &address);
                    Self::mark_seen(&mut last_seen, &events, address);
                }
            }
        }

        info!("Starting presence watch");
        let mut scan_stream = self.adapter.scan(&[]).await?;
        let mut sweep = tokio::time::interval(Duration::from_secs(PRESENCE_SWEEP_INTERVAL_SECS));

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(discovered) => {
                            let device = discovered.device;
                            if let Some(address) = self.match_associated(&device).await {
                                self.register(&device, &address);
                                Self::mark_seen(&mut last_seen, &events, address);
                            }
                        }
                        None => {
                            warn!("Presence scan stream ended");
                            break;
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.sweep_expired(&mut last_seen, &events).await;
                }
                _ = self.cancel_token.cancelled() => break,
            }
        }
        Ok(())
    }

    /// Parks the handle so the link factory can resolve the address later.
    fn register(&self, device: &Device, address: &str) {
        self.devices
            .lock()
            .expect("device map poisoned")
            .insert(address.to_string(), device.clone());
    }

    fn mark_seen(
        last_seen: &mut HashMap<String, Instant>,
        events: &mpsc::UnboundedSender<PresenceEvent>,
        address: String,
    ) {
        let newly_present = last_seen.insert(address.clone(), Instant::now()).is_none();
        if newly_present {
            info!("Device appeared: {address}");
            let _ = events.send(PresenceEvent::Appeared(DeviceKey::Address(address)));
        }
    }

    async fn sweep_expired(
        &self,
        last_seen: &mut HashMap<String, Instant>,
        events: &mpsc::UnboundedSender<PresenceEvent>,
    ) {
        let timeout = Duration::from_secs(PRESENCE_TIMEOUT_SECS);
        let expired: Vec<String> = last_seen
            .iter()
            .filter(|(_, seen)| seen.elapsed() > timeout)
            .map(|(address, _)| address.clone())
            .collect();

        for address in expired {
            last_seen.remove(&address);
            info!("Device disappeared: {address}");
            // newer association records carry an id; report with it so the
            // id-keyed path stays exercised end to end
            let key = match self.associations.find_by_address(&address).await {
                Some(identity) => identity
                    .id
                    .map(DeviceKey::AssociationId)
                    .unwrap_or(DeviceKey::Address(address)),
                None => DeviceKey::Address(address),
            };
            let _ = events.send(PresenceEvent::Disappeared(key));
        }
    }

    /// Resolves an advertisement to an associated camera's address. On
    /// platforms with opaque device ids the match falls back to the
    /// advertised name.
    async fn match_associated(&self, device: &Device) -> Option<String> {
        if self.capabilities.ids_expose_mac {
            let address = extract_mac_address(&device.id().to_string())?;
            return self
                .associations
                .find_by_address(&address)
                .await
                .map(|identity| identity.address);
        }

        let name = device.name().ok()?;
        self.associations
            .list()
            .await
            .into_iter()
            .find(|identity| identity.name == name)
            .map(|identity| identity.address)
    }
}

/// Applies settings to presence events and drives the service.
pub struct LifecycleController {
    settings: Arc<SettingsStore>,
    associations: Arc<AssociationStore>,
    service: mpsc::UnboundedSender<ServiceCommand>,
}

impl LifecycleController {
    pub fn new(
        settings: Arc<SettingsStore>,
        associations: Arc<AssociationStore>,
        service: mpsc::UnboundedSender<ServiceCommand>,
    ) -> Self {
        Self {
            settings,
            associations,
            service,
        }
    }

    /// Starts sessions for cameras marked keep-alive. Those do not wait for
    /// (or trust) presence events at all.
    pub async fn start_keep_alive_sessions(&self) {
        if !self.settings.app_enabled().await {
            return;
        }

        for identity in self.associations.list().await {
            let device = self.settings.device(&identity.address).await;
            if device.enabled && device.keep_alive {
                info!("Starting keep-alive session for {}", identity.address);
                let _ = self.service.send(ServiceCommand::Start {
                    address: identity.address,
                    mode: StartMode::Presence,
                });
            }
        }
    }

    /// Consumes presence events until the stream closes, then requests a
    /// graceful shutdown defensively — some hosts kill the watcher without
    /// ever delivering a disappearance.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<PresenceEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }

        info!("Presence events ended, requesting graceful shutdown");
        let _ = self.service.send(ServiceCommand::RequestShutdown);
    }

    pub async fn handle_event(&self, event: PresenceEvent) {
        match event {
            PresenceEvent::Appeared(key) => {
                let Some(address) = self.resolve(key).await else {
                    return;
                };
                if !self.settings.app_enabled().await {
                    debug!("Bridge disabled, ignoring appearance of {address}");
                    return;
                }
                if !self.settings.device(&address).await.enabled {
                    info!("Device {address} is disabled, not starting a session");
                    return;
                }
                let _ = self.service.send(ServiceCommand::Start {
                    address,
                    mode: StartMode::Presence,
                });
            }
            PresenceEvent::Disappeared(key) => {
                let Some(address) = self.resolve(key).await else {
                    return;
                };
                if self.settings.device(&address).await.keep_alive {
                    info!("Keep-alive set for {address}, ignoring disappearance");
                    return;
                }
                let _ = self.service.send(ServiceCommand::RequestShutdown);
            }
        }
    }

    /// Normalizes either key shape to the canonical address.
    async fn resolve(&self, key: DeviceKey) -> Option<String> {
        match key {
            DeviceKey::Address(address) => match normalize_address(&address) {
                Ok(address) => Some(address),
                Err(e) => {
                    warn!("Ignoring presence event: {e}");
                    None
                }
            },
            DeviceKey::AssociationId(id) => {
                let identity = self.associations.find_by_id(id).await;
                if identity.is_none() {
                    warn!("Presence event for unknown association id {id}");
                }
                identity.map(|identity| identity.address)
            }
        }
    }
}
