use std::path::Path;
use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use tokio::fs;

use crate::error::BridgeError;

/// Asynchronously ensures that a directory exists, creating it if it does not.
/// This function is idempotent.
pub async fn ensure_directory_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        fs::create_dir_all(path).await?;
    }
    Ok(())
}

fn mac_regex() -> &'static Regex {
    static MAC_RE: OnceLock<Regex> = OnceLock::new();
    MAC_RE.get_or_init(|| Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("valid regex"))
}

fn embedded_mac_regex() -> &'static Regex {
    static MAC_RE: OnceLock<Regex> = OnceLock::new();
    MAC_RE.get_or_init(|| {
        Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").expect("valid regex")
    })
}

/// Validates a MAC-like device address and returns it in canonical
/// (uppercase, colon-separated) form. The address is the natural key for
/// everything camera-related, so every entry point normalizes through here.
pub fn normalize_address(address: &str) -> Result<String, BridgeError> {
    let candidate = address.trim().replace('-', ":");
    if mac_regex().is_match(&candidate) {
        Ok(candidate.to_uppercase())
    } else {
        Err(BridgeError::InvalidAddress(address.to_string()))
    }
}

/// Extracts a MAC address embedded in a platform device id, if the platform
/// exposes one there (Windows and Linux do, macOS uses opaque UUIDs).
pub fn extract_mac_address(device_id_str: &str) -> Option<String> {
    embedded_mac_regex()
        .find_iter(device_id_str)
        .last()
        .map(|m| m.as_str().replace('-', ":").to_uppercase())
}
