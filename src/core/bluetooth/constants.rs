//! Constants used throughout the application
//! This module contains all the constant values used in the application,
//! such as UUIDs, thresholds, and other configuration values.

use uuid::Uuid;

/// Manufacturer id Sony uses in its BLE advertisements
pub const SONY_MANUFACTURER_ID: u16 = 0x012D;

/// The UUID of the Sony camera location service
pub const UUID_CAMERA_SERVICE: Uuid = Uuid::from_u128(0x8000dd00_dd00_ffff_ffff_ffffffffffff);

/// The UUID of the characteristic location packets are written to
pub const UUID_LOCATION_WRITE_CHAR: Uuid = Uuid::from_u128(0x0000dd11_0000_1000_8000_00805f9b34fb);

/// The UUID of the capability-flags characteristic (read)
pub const UUID_CAPABILITY_READ_CHAR: Uuid = Uuid::from_u128(0x0000dd21_0000_1000_8000_00805f9b34fb);

/// Some camera models gate location acceptance behind a two-step command:
/// first unlock, then lock. Both take the single-byte enable payload.
pub const UUID_GPS_UNLOCK_CHAR: Uuid = Uuid::from_u128(0x0000dd30_0000_1000_8000_00805f9b34fb);
pub const UUID_GPS_LOCK_CHAR: Uuid = Uuid::from_u128(0x0000dd31_0000_1000_8000_00805f9b34fb);

/// Payload written to the unlock and lock characteristics
pub const GPS_ENABLE_COMMAND: [u8; 1] = [0x01];

/// Interval between location updates in milliseconds
pub const LOCATION_UPDATE_INTERVAL_MS: u64 = 5000;

/// Accuracy drop above which a new fix is considered much worse, in meters
pub const ACCURACY_THRESHOLD_METERS: f64 = 200.0;

/// Age after which a held fix is stale enough to be replaced by a worse one
pub const STALE_FIX_THRESHOLD_MS: i64 = 1000 * 60 * 5;

/// Grace period between a shutdown request and the actual teardown.
/// Presence-disappeared events flap on some hosts; a re-appearance inside
/// this window cancels the shutdown without touching the connection.
pub const SHUTDOWN_GRACE_MS: u64 = 10_000;

/// Minimum signal strength for a scan result to be reported
pub const MIN_RSSI_THRESHOLD: i16 = -85;

/// How often the presence watcher sweeps for vanished cameras, in seconds
pub const PRESENCE_SWEEP_INTERVAL_SECS: u64 = 5;

/// Silence after which an associated camera counts as disappeared
pub const PRESENCE_TIMEOUT_SECS: u64 = 15;
