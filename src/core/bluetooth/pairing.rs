//! Bonding helpers.
//!
//! Association (our remembered-camera record) and bonding (the OS-level
//! link key) are separate things; the session needs both. Pairing-state
//! queries swallow platform errors — a revoked permission or a vanished
//! adapter reads as "not paired", it never propagates.

use bluest::Device;
use log::{error, info, warn};

use crate::core::bluetooth::types::PairingState;

/// Whether the device is currently bonded. Errors are treated as unknown,
/// reported as `false`.
pub async fn is_device_paired(device: &Device) -> bool {
    match device.is_paired().await {
        Ok(paired) => paired,
        Err(e) => {
            warn!("Could not query pairing state: {e}");
            false
        }
    }
}

/// Makes sure the camera is bonded, initiating pairing when it is not.
/// The camera shows a confirmation prompt on its screen during this.
pub async fn ensure_paired(device: &Device) -> PairingState {
    if is_device_paired(device).await {
        info!("Device is already paired");
        return PairingState::Paired;
    }

    info!("Device not paired, initiating pairing");
    match device.pair().await {
        Ok(()) => {
            info!("Pairing successful");
            PairingState::Paired
        }
        Err(e) => {
            error!("Failed to initiate pairing: {e}");
            PairingState::PairingFailed
        }
    }
}
