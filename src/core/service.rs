//! The location sender service.
//!
//! Long-running host for the camera session: one task owning the session,
//! consuming control commands, GATT completions and location fixes from its
//! channels. Because it is the only mutator, the session needs no locking.
//! The service also owns the shutdown grace timer — the debounce that
//! absorbs flaky presence signals without tearing the GATT link down.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::SettingsStore;
use crate::core::bluetooth::constants::SHUTDOWN_GRACE_MS;
use crate::core::bluetooth::link::{LinkFactory, SessionEvent};
use crate::core::bluetooth::session::{CameraSession, StartMode};
use crate::core::location::provider::{ChannelLocationUpdates, LocationCtl};
use crate::core::location::LocationSample;
use crate::utils::normalize_address;

/// Control surface of the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCommand {
    /// Start (or resume) the session for a camera.
    Start { address: String, mode: StartMode },
    /// Request the cancelable graceful shutdown.
    RequestShutdown,
    /// Internal: the grace period elapsed without a cancellation.
    FinalizeShutdown,
    /// Hard stop: tear everything down and exit the loop.
    Stop,
}

pub struct LocationSenderService<F: LinkFactory> {
    factory: F,
    settings: Arc<SettingsStore>,
    control_tx: mpsc::UnboundedSender<ServiceCommand>,
    control_rx: mpsc::UnboundedReceiver<ServiceCommand>,
    gatt_tx: mpsc::UnboundedSender<SessionEvent>,
    gatt_rx: mpsc::UnboundedReceiver<SessionEvent>,
    location_ctl: mpsc::UnboundedSender<LocationCtl>,
    fixes_rx: mpsc::UnboundedReceiver<LocationSample>,
    session: Option<CameraSession<F::Link>>,
    shutdown_timer: Option<CancellationToken>,
}

impl<F: LinkFactory> LocationSenderService<F> {
    /// Builds the service and hands back the sender used to control it.
    pub fn new(
        factory: F,
        settings: Arc<SettingsStore>,
        location_ctl: mpsc::UnboundedSender<LocationCtl>,
        fixes_rx: mpsc::UnboundedReceiver<LocationSample>,
    ) -> (Self, mpsc::UnboundedSender<ServiceCommand>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (gatt_tx, gatt_rx) = mpsc::unbounded_channel();

        let service = Self {
            factory,
            settings,
            control_tx: control_tx.clone(),
            control_rx,
            gatt_tx,
            gatt_rx,
            location_ctl,
            fixes_rx,
            session: None,
            shutdown_timer: None,
        };
        (service, control_tx)
    }

    /// Runs until a `Stop` arrives or every control handle is gone.
    pub async fn run(mut self) {
        info!("Location sender service started");

        loop {
            tokio::select! {
                command = self.control_rx.recv() => {
                    match command {
                        Some(command) => {
                            if !self.on_command(command).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                Some(event) = self.gatt_rx.recv() => {
                    if let Some(session) = &mut self.session {
                        session.handle(event);
                    }
                }
                Some(fix) = self.fixes_rx.recv() => {
                    if let Some(session) = &mut self.session {
                        session.on_location(fix);
                    }
                }
            }
        }

        self.disarm_shutdown_timer();
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        info!("Location sender service stopped");
    }

    /// Returns false when the loop should exit.
    async fn on_command(&mut self, command: ServiceCommand) -> bool {
        match command {
            ServiceCommand::Start { address, mode } => {
                self.on_start(address, mode).await;
                true
            }
            ServiceCommand::RequestShutdown => {
                self.on_request_shutdown().await;
                true
            }
            ServiceCommand::FinalizeShutdown => {
                self.on_finalize_shutdown();
                true
            }
            ServiceCommand::Stop => false,
        }
    }

    async fn on_start(&mut self, address: String, mode: StartMode) {
        let address = match normalize_address(&address) {
            Ok(address) => address,
            Err(e) => {
                error!("Refusing to start session: {e}");
                return;
            }
        };

        // starting normally cancels any pending shutdown
        self.disarm_shutdown_timer();

        // one camera at a time: a start for another address replaces the
        // active session
        if let Some(session) = &mut self.session {
            if session.address() != address {
                info!(
                    "Switching camera from {} to {address}",
                    session.address()
                );
                session.close();
                self.session = None;
            }
        }

        match &mut self.session {
            Some(session) => {
                if let Err(e) = session.start(&self.factory) {
                    error!("Failed to restart session for {address}: {e}");
                }
            }
            None => {
                let timezone = self.settings.timezone().await;
                let updates = Box::new(ChannelLocationUpdates::new(self.location_ctl.clone()));
                match CameraSession::new(&address, mode, timezone, updates, self.gatt_tx.clone()) {
                    Ok(mut session) => match session.start(&self.factory) {
                        Ok(()) => self.session = Some(session),
                        Err(e) => error!("Failed to start session for {address}: {e}"),
                    },
                    Err(e) => error!("Failed to create session for {address}: {e}"),
                }
            }
        }
    }

    async fn on_request_shutdown(&mut self) {
        let Some(session) = &mut self.session else {
            debug!("Shutdown requested with no active session");
            return;
        };

        if self.settings.device(session.address()).await.keep_alive {
            info!(
                "Keep-alive enabled for {}, ignoring shutdown request",
                session.address()
            );
            return;
        }

        let was_pending = session.pending_shutdown();
        session.request_shutdown();
        if !was_pending {
            self.arm_shutdown_timer();
        }
    }

    fn on_finalize_shutdown(&mut self) {
        self.shutdown_timer = None;
        match self.session.take() {
            Some(mut session) if session.pending_shutdown() => {
                info!("Finalizing shutdown for {}", session.address());
                session.close();
            }
            Some(session) => {
                debug!("Shutdown was cancelled before finalization");
                self.session = Some(session);
            }
            None => {}
        }
    }

    /// Arms the grace timer exactly once per request cycle.
    fn arm_shutdown_timer(&mut self) {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let control = self.control_tx.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(SHUTDOWN_GRACE_MS)) => {
                    let _ = control.send(ServiceCommand::FinalizeShutdown);
                }
            }
        });
        self.shutdown_timer = Some(token);
    }

    fn disarm_shutdown_timer(&mut self) {
        if let Some(token) = self.shutdown_timer.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use bluest::Uuid;

    use crate::core::bluetooth::constants::UUID_LOCATION_WRITE_CHAR;
    use crate::core::bluetooth::link::{GattRequests, GattStatus};
    use crate::error::Result;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Connect,
        Discover,
        Write(Uuid, usize),
        Close,
    }

    #[derive(Clone)]
    struct MockLink {
        ops: Arc<Mutex<Vec<Op>>>,
        known: Arc<Mutex<HashSet<Uuid>>>,
        events: Arc<Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>>,
    }

    impl MockLink {
        fn new() -> Self {
            Self {
                ops: Arc::new(Mutex::new(Vec::new())),
                known: Arc::new(Mutex::new(HashSet::from([UUID_LOCATION_WRITE_CHAR]))),
                events: Arc::new(Mutex::new(None)),
            }
        }

        fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }

        fn writes(&self) -> usize {
            self.ops()
                .iter()
                .filter(|op| matches!(op, Op::Write(..)))
                .count()
        }

        fn send(&self, event: SessionEvent) {
            let events = self.events.lock().unwrap();
            events
                .as_ref()
                .expect("link not opened yet")
                .send(event)
                .unwrap();
        }

        /// Simulates the connected camera announcing only the location
        /// characteristic.
        fn complete_connection(&self) {
            self.send(SessionEvent::ConnectionChanged {
                status: GattStatus::Success,
            });
            self.send(SessionEvent::ServicesDiscovered {
                status: GattStatus::Success,
                characteristics: vec![UUID_LOCATION_WRITE_CHAR],
            });
        }
    }

    impl GattRequests for MockLink {
        fn request_connect(&self) {
            self.ops.lock().unwrap().push(Op::Connect);
        }

        fn request_discover(&self) {
            self.ops.lock().unwrap().push(Op::Discover);
        }

        fn request_write(&self, characteristic: Uuid, value: Vec<u8>) -> bool {
            if !self.known.lock().unwrap().contains(&characteristic) {
                return false;
            }
            self.ops
                .lock()
                .unwrap()
                .push(Op::Write(characteristic, value.len()));
            true
        }

        fn request_read(&self, _characteristic: Uuid) -> bool {
            false
        }

        fn close(&self) {
            self.ops.lock().unwrap().push(Op::Close);
        }
    }

    #[derive(Clone)]
    struct MockFactory {
        link: MockLink,
    }

    impl LinkFactory for MockFactory {
        type Link = MockLink;

        fn open(
            &self,
            _address: &str,
            events: mpsc::UnboundedSender<SessionEvent>,
        ) -> Result<Self::Link> {
            *self.link.events.lock().unwrap() = Some(events);
            Ok(self.link.clone())
        }
    }

    struct Harness {
        link: MockLink,
        control: mpsc::UnboundedSender<ServiceCommand>,
        location_ctl_rx: mpsc::UnboundedReceiver<LocationCtl>,
        fixes_tx: mpsc::UnboundedSender<LocationSample>,
        service: tokio::task::JoinHandle<()>,
        settings: Arc<SettingsStore>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsStore::load(dir.path()).await.unwrap());
        let link = MockLink::new();
        let factory = MockFactory { link: link.clone() };

        let (location_ctl_tx, location_ctl_rx) = mpsc::unbounded_channel();
        let (fixes_tx, fixes_rx) = mpsc::unbounded_channel();
        let (service, control) =
            LocationSenderService::new(factory, settings.clone(), location_ctl_tx, fixes_rx);
        let service = tokio::spawn(service.run());

        Harness {
            link,
            control,
            location_ctl_rx,
            fixes_tx,
            service,
            settings,
            _dir: dir,
        }
    }

    fn fix() -> LocationSample {
        LocationSample {
            latitude: 35.6586,
            longitude: 139.7454,
            accuracy_m: 10.0,
            fix_time_ms: 0,
            provider: "fused".to_string(),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached in time");
    }

    async fn start_streaming(h: &mut Harness) {
        h.control
            .send(ServiceCommand::Start {
                address: ADDRESS.to_string(),
                mode: StartMode::Presence,
            })
            .unwrap();
        let link = h.link.clone();
        wait_until(move || link.ops().contains(&Op::Connect)).await;
        h.link.complete_connection();

        // the session asks the provider for updates once streaming begins
        let started = h.location_ctl_rx.recv().await;
        assert_eq!(started, Some(LocationCtl::Start));
    }

    #[tokio::test(start_paused = true)]
    async fn fixes_flow_to_the_camera_once_streaming() {
        let mut h = harness().await;
        start_streaming(&mut h).await;

        h.fixes_tx.send(fix()).unwrap();
        let link = h.link.clone();
        wait_until(move || link.writes() == 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_shutdown_finalizes_after_the_grace_period() {
        let mut h = harness().await;
        start_streaming(&mut h).await;

        h.control.send(ServiceCommand::RequestShutdown).unwrap();
        let link = h.link.clone();
        wait_until(move || link.ops().contains(&Op::Close)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn reappearance_cancels_a_pending_shutdown() {
        let mut h = harness().await;
        start_streaming(&mut h).await;

        h.control.send(ServiceCommand::RequestShutdown).unwrap();
        // the camera comes back before the grace period elapses
        h.control
            .send(ServiceCommand::Start {
                address: ADDRESS.to_string(),
                mode: StartMode::Presence,
            })
            .unwrap();
        let link = h.link.clone();
        wait_until(move || {
            link.ops().iter().filter(|op| **op == Op::Connect).count() == 2
        })
        .await;
        h.link.complete_connection();
        assert_eq!(h.location_ctl_rx.recv().await, Some(LocationCtl::Start));

        // give the (paused) clock every chance to fire a stray timer
        tokio::time::sleep(Duration::from_millis(SHUTDOWN_GRACE_MS * 3)).await;
        assert!(!h.link.ops().contains(&Op::Close));

        // still streaming: fixes keep flowing
        h.fixes_tx.send(fix()).unwrap();
        let link = h.link.clone();
        wait_until(move || link.writes() == 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_ignores_shutdown_requests() {
        let mut h = harness().await;
        h.settings
            .update_device(ADDRESS, |d| d.keep_alive = true)
            .await
            .unwrap();
        start_streaming(&mut h).await;

        h.control.send(ServiceCommand::RequestShutdown).unwrap();
        tokio::time::sleep(Duration::from_millis(SHUTDOWN_GRACE_MS * 3)).await;
        assert!(!h.link.ops().contains(&Op::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_tears_the_session_down() {
        let mut h = harness().await;
        start_streaming(&mut h).await;

        h.control.send(ServiceCommand::Stop).unwrap();
        let link = h.link.clone();
        wait_until(move || link.ops().contains(&Op::Close)).await;
        h.service.await.unwrap();
    }
}
