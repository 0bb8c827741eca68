//! BLE session state machine for one camera.
//!
//! Owns the GATT link for a single address and drives
//! connect → discover → [GPS unlock handshake] → stream. All state changes
//! happen in [`CameraSession::handle`], fed from the service loop's event
//! channel; nothing here blocks on a Bluetooth operation. The machine
//! performs no reconnect loop of its own — reconnection is presence-driven
//! and arrives as a fresh `start`.

use bluest::Uuid;
use chrono::Utc;
use chrono_tz::Tz;
use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::core::bluetooth::constants::{
    GPS_ENABLE_COMMAND, UUID_CAPABILITY_READ_CHAR, UUID_GPS_LOCK_CHAR, UUID_GPS_UNLOCK_CHAR,
    UUID_LOCATION_WRITE_CHAR,
};
use crate::core::bluetooth::link::{GattRequests, GattStatus, LinkFactory, SessionEvent};
use crate::core::location::provider::LocationUpdates;
use crate::core::location::{LocationSample, PacketConfig, build_location_packet, has_time_zone_dst_flag, should_accept};
use crate::error::Result;
use crate::utils::normalize_address;

/// Where the session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    DiscoveringServices,
    UnlockingGps,
    Streaming,
    Disconnected,
}

/// How the session was started. Manual starts fail fast on connection
/// errors; presence-driven starts keep the link around for the next
/// presence signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    Manual,
    Presence,
}

/// State machine for the location stream to one camera.
pub struct CameraSession<L: GattRequests> {
    address: String,
    mode: StartMode,
    phase: SessionPhase,
    link: Option<L>,
    write_characteristic: Option<Uuid>,
    packet_config: PacketConfig,
    current_fix: Option<LocationSample>,
    pending_shutdown: bool,
    locations: Box<dyn LocationUpdates>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl<L: GattRequests> CameraSession<L> {
    pub fn new(
        address: &str,
        mode: StartMode,
        timezone: Tz,
        locations: Box<dyn LocationUpdates>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self> {
        Ok(Self {
            address: normalize_address(address)?,
            mode,
            phase: SessionPhase::Idle,
            link: None,
            write_characteristic: None,
            packet_config: PacketConfig::new(timezone),
            current_fix: None,
            pending_shutdown: false,
            locations,
            events,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn has_link(&self) -> bool {
        self.link.is_some()
    }

    pub fn pending_shutdown(&self) -> bool {
        self.pending_shutdown
    }

    /// Starts (or re-starts) the session. An existing link is reused, never
    /// duplicated; the connect outcome arrives as a
    /// [`SessionEvent::ConnectionChanged`].
    pub fn start<F>(&mut self, factory: &F) -> Result<()>
    where
        F: LinkFactory<Link = L>,
    {
        self.cancel_shutdown();

        match &self.link {
            Some(link) => {
                info!("Link will be reused");
                link.request_connect();
            }
            None => {
                info!("Link will be created");
                let link = factory.open(&self.address, self.events.clone())?;
                link.request_connect();
                self.link = Some(link);
            }
        }
        self.phase = SessionPhase::Connecting;
        Ok(())
    }

    /// Feeds one GATT completion event through the machine.
    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::ConnectionChanged { status } => {
                if status.is_success() {
                    info!("Connected to device {}", self.address);
                    self.cancel_shutdown();
                    if let Some(link) = &self.link {
                        link.request_discover();
                        self.phase = SessionPhase::DiscoveringServices;
                    }
                } else {
                    self.connection_failed("connection state change", &status);
                }
            }
            SessionEvent::ServicesDiscovered {
                status,
                characteristics,
            } => {
                if status.is_success() {
                    self.on_services_discovered(&characteristics);
                } else {
                    self.connection_failed("service discovery", &status);
                }
            }
            SessionEvent::CharacteristicWritten {
                characteristic,
                status,
            } => self.on_characteristic_written(characteristic, &status),
            SessionEvent::CharacteristicRead {
                characteristic,
                status,
                value,
            } => {
                if characteristic == UUID_CAPABILITY_READ_CHAR && status.is_success() {
                    self.packet_config.include_tz_dst = has_time_zone_dst_flag(&value);
                    info!(
                        "Capability flags read, include_tz_dst: {}",
                        self.packet_config.include_tz_dst
                    );
                }
            }
        }
    }

    fn on_services_discovered(&mut self, characteristics: &[Uuid]) {
        self.write_characteristic = characteristics
            .iter()
            .copied()
            .find(|uuid| *uuid == UUID_LOCATION_WRITE_CHAR);
        if self.write_characteristic.is_none() {
            warn!("Location characteristic not found on {}", self.address);
        }

        if characteristics.contains(&UUID_CAPABILITY_READ_CHAR) {
            if let Some(link) = &self.link {
                link.request_read(UUID_CAPABILITY_READ_CHAR);
            }
        }

        if characteristics.contains(&UUID_GPS_UNLOCK_CHAR) {
            info!("Enabling GPS characteristic: {UUID_GPS_UNLOCK_CHAR}");
            if let Some(link) = &self.link {
                link.request_write(UUID_GPS_UNLOCK_CHAR, GPS_ENABLE_COMMAND.to_vec());
            }
            self.phase = SessionPhase::UnlockingGps;
        } else {
            // No unlock gate on this camera model, start transmitting directly
            self.begin_streaming();
        }
    }

    fn on_characteristic_written(&mut self, characteristic: Uuid, status: &GattStatus) {
        if characteristic == UUID_GPS_UNLOCK_CHAR {
            // The GPS command has been unlocked, now lock it for us
            if let Some(link) = &self.link {
                if !link.request_write(UUID_GPS_LOCK_CHAR, GPS_ENABLE_COMMAND.to_vec()) {
                    warn!("GPS lock characteristic not found on {}", self.address);
                }
            }
        } else if characteristic == UUID_GPS_LOCK_CHAR {
            info!("GPS flag enabled on device, will now send data");
            self.begin_streaming();
        }

        if !status.is_success() {
            error!("Error writing characteristic {characteristic}: {status:?}");
        }
    }

    fn begin_streaming(&mut self) {
        self.phase = SessionPhase::Streaming;
        self.locations.start();
    }

    fn connection_failed(&mut self, context: &str, status: &GattStatus) {
        error!("An error happened during {context}: {status:?}");

        // A subscription feeding a dead connection is wasted work
        self.locations.stop();

        match self.mode {
            StartMode::Manual => {
                if let Some(link) = self.link.take() {
                    link.close();
                }
                self.write_characteristic = None;
            }
            StartMode::Presence => {
                // keep the link; the next presence signal retries
            }
        }
        self.phase = SessionPhase::Disconnected;
    }

    /// A new fix from the provider. Applies the freshness policy, then
    /// encodes and writes. Failures are logged, never retried — the next
    /// accepted fix is the retry.
    pub fn on_location(&mut self, sample: LocationSample) {
        if self.phase != SessionPhase::Streaming || self.pending_shutdown {
            return;
        }

        if should_accept(self.current_fix.as_ref(), &sample) {
            self.current_fix = Some(sample);
            self.send_current();
        }
    }

    fn send_current(&mut self) {
        let (Some(link), Some(characteristic)) = (self.link.as_ref(), self.write_characteristic)
        else {
            warn!("Cannot send data: link or characteristic is missing");
            return;
        };
        let Some(sample) = &self.current_fix else {
            return;
        };

        let packet = build_location_packet(&self.packet_config, sample, Utc::now());
        if !link.request_write(characteristic, packet) {
            error!("Failed to send location data to camera");
        }
    }

    /// Marks the session for shutdown. Idempotent; forwarding of fixes is
    /// suspended until the request is cancelled or finalized. The link is
    /// deliberately left untouched so a cancellation resumes seamlessly.
    pub fn request_shutdown(&mut self) {
        if self.pending_shutdown {
            info!("Shutdown already requested, ignoring duplicate request");
            return;
        }
        self.pending_shutdown = true;
    }

    /// Cancels a pending shutdown, if any.
    pub fn cancel_shutdown(&mut self) {
        if self.pending_shutdown {
            info!("Cancelling pending shutdown");
            self.pending_shutdown = false;
        }
    }

    /// Re-validates an existing link after a reconnect or a cancelled
    /// shutdown by running service discovery again.
    pub fn resume(&mut self) {
        self.cancel_shutdown();
        match &self.link {
            Some(link) => {
                link.request_discover();
                self.phase = SessionPhase::DiscoveringServices;
            }
            None => warn!("Cannot resume location transmission: no link"),
        }
    }

    /// Hard teardown: stops location updates and releases the link. This is
    /// the only path that drops the GATT handle.
    pub fn close(&mut self) {
        self.cancel_shutdown();
        self.locations.stop();
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.write_characteristic = None;
        self.phase = SessionPhase::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Connect,
        Discover,
        Write(Uuid, Vec<u8>),
        Read(Uuid),
        Close,
    }

    /// Recording in-memory link; the second implementation behind the
    /// adapter contract.
    #[derive(Clone)]
    struct MockLink {
        ops: Arc<Mutex<Vec<Op>>>,
        known: Arc<Mutex<HashSet<Uuid>>>,
    }

    impl MockLink {
        fn new() -> Self {
            Self {
                ops: Arc::new(Mutex::new(Vec::new())),
                known: Arc::new(Mutex::new(HashSet::new())),
            }
        }

        fn make_known(&self, uuids: &[Uuid]) {
            let mut known = self.known.lock().unwrap();
            known.extend(uuids.iter().copied());
        }

        fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }

        fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
            self.ops()
                .into_iter()
                .filter_map(|op| match op {
                    Op::Write(uuid, value) => Some((uuid, value)),
                    _ => None,
                })
                .collect()
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
            self.ops.lock().unwrap().push(Op::Write(characteristic, value));
            true
        }

        fn request_read(&self, characteristic: Uuid) -> bool {
            if !self.known.lock().unwrap().contains(&characteristic) {
                return false;
            }
            self.ops.lock().unwrap().push(Op::Read(characteristic));
            true
        }

        fn close(&self) {
            self.ops.lock().unwrap().push(Op::Close);
        }
    }

    struct MockFactory {
        link: MockLink,
        opened: AtomicUsize,
    }

    impl MockFactory {
        fn new(link: MockLink) -> Self {
            Self {
                link,
                opened: AtomicUsize::new(0),
            }
        }

        fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }
    }

    impl LinkFactory for MockFactory {
        type Link = MockLink;

        fn open(
            &self,
            _address: &str,
            _events: mpsc::UnboundedSender<SessionEvent>,
        ) -> Result<Self::Link> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(self.link.clone())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingUpdates {
        started: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
    }

    impl LocationUpdates for RecordingUpdates {
        fn start(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn stop(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn fix(accuracy_m: f64, fix_time_ms: i64) -> LocationSample {
        LocationSample {
            latitude: 35.6586,
            longitude: 139.7454,
            accuracy_m,
            fix_time_ms,
            provider: "fused".to_string(),
        }
    }

    fn new_session(
        mode: StartMode,
    ) -> (CameraSession<MockLink>, MockFactory, MockLink, RecordingUpdates) {
        let link = MockLink::new();
        let factory = MockFactory::new(link.clone());
        let updates = RecordingUpdates::default();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let session = CameraSession::new(
            ADDRESS,
            mode,
            chrono_tz::Asia::Tokyo,
            Box::new(updates.clone()),
            events_tx,
        )
        .unwrap();
        (session, factory, link, updates)
    }

    fn success() -> GattStatus {
        GattStatus::Success
    }

    fn failure() -> GattStatus {
        GattStatus::Failure("status 133".to_string())
    }

    /// Drives a started session up to the discovery callback for a camera
    /// exposing `characteristics`.
    fn discover(session: &mut CameraSession<MockLink>, link: &MockLink, characteristics: &[Uuid]) {
        link.make_known(characteristics);
        session.handle(SessionEvent::ConnectionChanged { status: success() });
        session.handle(SessionEvent::ServicesDiscovered {
            status: success(),
            characteristics: characteristics.to_vec(),
        });
    }

    #[test]
    fn rejects_invalid_addresses() {
        let updates = RecordingUpdates::default();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let result: Result<CameraSession<MockLink>> = CameraSession::new(
            "garbage",
            StartMode::Manual,
            chrono_tz::UTC,
            Box::new(updates),
            events_tx,
        );
        assert!(result.is_err());
    }

    #[test]
    fn starting_twice_reuses_the_link() {
        let (mut session, factory, link, _) = new_session(StartMode::Presence);

        session.start(&factory).unwrap();
        session.start(&factory).unwrap();

        assert_eq!(factory.opened(), 1);
        assert!(session.has_link());
        assert_eq!(
            link.ops().iter().filter(|op| **op == Op::Connect).count(),
            2
        );
    }

    #[test]
    fn camera_without_unlock_characteristic_streams_directly() {
        let (mut session, factory, link, updates) = new_session(StartMode::Presence);
        session.start(&factory).unwrap();
        assert_eq!(session.phase(), SessionPhase::Connecting);

        discover(&mut session, &link, &[UUID_LOCATION_WRITE_CHAR]);

        assert_eq!(session.phase(), SessionPhase::Streaming);
        assert_eq!(updates.started.load(Ordering::SeqCst), 1);
        assert!(link.writes().is_empty());

        session.on_location(fix(10.0, 0));
        let writes = link.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, UUID_LOCATION_WRITE_CHAR);
        // timezone/DST format until a capability read says otherwise
        assert_eq!(writes[0].1.len(), 95);
    }

    #[test]
    fn capability_read_switches_to_the_short_packet() {
        let (mut session, factory, link, _) = new_session(StartMode::Presence);
        session.start(&factory).unwrap();
        discover(
            &mut session,
            &link,
            &[UUID_LOCATION_WRITE_CHAR, UUID_CAPABILITY_READ_CHAR],
        );
        assert_eq!(
            link.ops().iter().filter(|op| matches!(op, Op::Read(_))).count(),
            1
        );

        session.handle(SessionEvent::CharacteristicRead {
            characteristic: UUID_CAPABILITY_READ_CHAR,
            status: success(),
            value: vec![0x00, 0x00, 0x00, 0x00, 0x00],
        });

        session.on_location(fix(10.0, 0));
        let writes = link.writes();
        assert_eq!(writes.last().unwrap().1.len(), 91);
    }

    #[test]
    fn unlock_then_lock_must_complete_before_streaming() {
        let (mut session, factory, link, updates) = new_session(StartMode::Presence);
        session.start(&factory).unwrap();

        discover(
            &mut session,
            &link,
            &[
                UUID_LOCATION_WRITE_CHAR,
                UUID_GPS_UNLOCK_CHAR,
                UUID_GPS_LOCK_CHAR,
            ],
        );
        assert_eq!(session.phase(), SessionPhase::UnlockingGps);
        assert_eq!(updates.started.load(Ordering::SeqCst), 0);
        assert_eq!(link.writes(), vec![(UUID_GPS_UNLOCK_CHAR, vec![0x01])]);

        session.handle(SessionEvent::CharacteristicWritten {
            characteristic: UUID_GPS_UNLOCK_CHAR,
            status: success(),
        });
        assert_eq!(session.phase(), SessionPhase::UnlockingGps);
        assert_eq!(updates.started.load(Ordering::SeqCst), 0);
        assert_eq!(
            link.writes(),
            vec![
                (UUID_GPS_UNLOCK_CHAR, vec![0x01]),
                (UUID_GPS_LOCK_CHAR, vec![0x01]),
            ]
        );

        session.handle(SessionEvent::CharacteristicWritten {
            characteristic: UUID_GPS_LOCK_CHAR,
            status: success(),
        });
        assert_eq!(session.phase(), SessionPhase::Streaming);
        assert_eq!(updates.started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejected_fixes_do_not_reach_the_camera() {
        let (mut session, factory, link, _) = new_session(StartMode::Presence);
        session.start(&factory).unwrap();
        discover(&mut session, &link, &[UUID_LOCATION_WRITE_CHAR]);

        session.on_location(fix(5.0, 0));
        // much worse and not stale: dropped
        session.on_location(fix(400.0, 60_000));
        assert_eq!(link.writes().len(), 1);

        // much worse but stale: forwarded
        session.on_location(fix(400.0, 6 * 60 * 1000));
        assert_eq!(link.writes().len(), 2);
    }

    #[test]
    fn shutdown_request_is_idempotent_and_cancelable() {
        let (mut session, factory, link, _) = new_session(StartMode::Presence);
        session.start(&factory).unwrap();
        discover(&mut session, &link, &[UUID_LOCATION_WRITE_CHAR]);
        session.on_location(fix(10.0, 0));
        assert_eq!(link.writes().len(), 1);

        session.request_shutdown();
        session.request_shutdown();
        assert!(session.pending_shutdown());

        // no writes while a shutdown is pending
        session.on_location(fix(5.0, 1000));
        assert_eq!(link.writes().len(), 1);

        session.cancel_shutdown();
        assert!(!session.pending_shutdown());
        assert_eq!(session.phase(), SessionPhase::Streaming);
        assert!(session.has_link());

        session.on_location(fix(5.0, 2000));
        assert_eq!(link.writes().len(), 2);
    }

    #[test]
    fn presence_session_keeps_the_link_on_transient_failure() {
        let (mut session, factory, link, updates) = new_session(StartMode::Presence);
        session.start(&factory).unwrap();
        discover(&mut session, &link, &[UUID_LOCATION_WRITE_CHAR]);

        session.handle(SessionEvent::ConnectionChanged { status: failure() });

        assert_eq!(session.phase(), SessionPhase::Disconnected);
        assert!(session.has_link());
        assert_eq!(updates.stopped.load(Ordering::SeqCst), 1);
        assert!(!link.ops().contains(&Op::Close));

        // a fresh presence signal reconnects over the same link
        session.start(&factory).unwrap();
        assert_eq!(factory.opened(), 1);
        assert_eq!(session.phase(), SessionPhase::Connecting);
    }

    #[test]
    fn manual_session_fails_fast() {
        let (mut session, factory, link, updates) = new_session(StartMode::Manual);
        session.start(&factory).unwrap();

        session.handle(SessionEvent::ConnectionChanged { status: failure() });

        assert_eq!(session.phase(), SessionPhase::Disconnected);
        assert!(!session.has_link());
        assert!(link.ops().contains(&Op::Close));
        assert_eq!(updates.stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_fix_after_close_is_a_no_op() {
        let (mut session, factory, link, updates) = new_session(StartMode::Presence);
        session.start(&factory).unwrap();
        discover(&mut session, &link, &[UUID_LOCATION_WRITE_CHAR]);

        session.close();
        assert!(!session.has_link());
        assert_eq!(updates.stopped.load(Ordering::SeqCst), 1);
        assert!(link.ops().contains(&Op::Close));

        let before = link.writes().len();
        session.on_location(fix(10.0, 0));
        assert_eq!(link.writes().len(), before);
    }

    #[test]
    fn missing_lock_characteristic_is_logged_not_fatal() {
        let (mut session, factory, link, updates) = new_session(StartMode::Presence);
        session.start(&factory).unwrap();

        // unlock exists but lock does not; the handshake stalls without
        // taking the session down
        discover(
            &mut session,
            &link,
            &[UUID_LOCATION_WRITE_CHAR, UUID_GPS_UNLOCK_CHAR],
        );
        session.handle(SessionEvent::CharacteristicWritten {
            characteristic: UUID_GPS_UNLOCK_CHAR,
            status: success(),
        });

        assert_eq!(session.phase(), SessionPhase::UnlockingGps);
        assert_eq!(updates.started.load(Ordering::SeqCst), 0);
        assert!(session.has_link());
    }
}
