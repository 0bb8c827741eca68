//! Defines shared data structures for the Bluetooth module.

use serde::{Deserialize, Serialize};

/// OS-level bonding state of a camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingState {
    NotPaired,
    Pairing,
    Paired,
    PairingFailed,
}

/// An associated camera as the rest of the application sees it.
///
/// The canonical uppercase MAC address is the natural key; the numeric
/// association id is assigned by the association store and may be absent for
/// records imported from platforms that only key by address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Association id, if one was assigned
    pub id: Option<i32>,
    /// Canonical uppercase MAC address
    pub address: String,
    /// Display name reported by the camera
    pub name: String,
    /// Bonding state at the last time we checked
    pub pairing: PairingState,
}

impl DeviceIdentity {
    pub fn new(address: String, name: String) -> Self {
        Self {
            id: None,
            address,
            name,
            pairing: PairingState::NotPaired,
        }
    }
}

/// A camera seen during a scan, before it is associated.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredCamera {
    /// Platform-specific device id (opaque on macOS, carries the MAC elsewhere)
    pub platform_id: String,
    /// Canonical MAC address when the platform exposes one
    pub address: Option<String>,
    /// Advertised name, if any
    pub name: Option<String>,
    /// Signal strength of the advertisement
    pub rssi: Option<i16>,
}
