//! Bluetooth functionality for the camera bridge
//! This module handles all bluetooth operations including discovery,
//! connecting, and streaming location data to the camera.

pub mod capabilities;
pub mod constants;
pub mod link;
pub mod pairing;
pub mod scanner;
pub mod session;
pub mod types;

// Re-export types that should be publicly accessible
pub use capabilities::Capabilities;
pub use constants::*;
pub use link::{BluestLink, BluestLinkFactory, GattRequests, GattStatus, LinkFactory, SessionEvent};
pub use scanner::CameraScanner;
pub use session::{CameraSession, SessionPhase, StartMode};
pub use types::{DeviceIdentity, DiscoveredCamera, PairingState};
