//! Core functionality for the camera bridge
//! This module contains the session machinery, presence handling and the
//! location pipeline feeding the camera.

pub mod association;
pub mod bluetooth;
pub mod location;
pub mod presence;
pub mod service;

// Re-export commonly used types
pub use association::AssociationStore;
pub use bluetooth::{CameraSession, SessionPhase, StartMode};
pub use presence::{DeviceKey, LifecycleController, PresenceEvent, PresenceWatcher};
pub use service::{LocationSenderService, ServiceCommand};
