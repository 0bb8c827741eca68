//! Platform capability resolution.
//!
//! The few behaviors that differ per host platform are resolved once at
//! startup into this table; nothing downstream branches on the platform
//! directly.

/// What the current platform's Bluetooth stack can and cannot do.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// Whether platform device ids embed the MAC address. macOS hands out
    /// opaque per-app UUIDs instead, so cameras there have to be matched by
    /// advertisement content rather than by id.
    pub ids_expose_mac: bool,
}

/// Resolves the capability table for the running platform.
pub fn resolve() -> Capabilities {
    Capabilities {
        ids_expose_mac: !cfg!(target_os = "macos"),
    }
}
