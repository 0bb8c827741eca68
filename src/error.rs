use std::io;

use bluest::Uuid;
use thiserror::Error;

/// Errors produced while talking to the camera or the local stores.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("No Bluetooth adapter found")]
    AdapterUnavailable,

    #[error("Device not found with address: {0}")]
    DeviceNotFound(String),

    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    #[error("Camera service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Bluetooth transport error: {source}")]
    Transport {
        #[from]
        source: bluest::Error,
    },

    #[error("Failed to read/write store file: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("Failed to parse store file: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, BridgeError>;
