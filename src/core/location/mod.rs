//! Location handling for the camera bridge: the fix model, the freshness
//! policy deciding which fixes are worth forwarding, the vendor packet
//! encoder and the pluggable location provider.

pub mod freshness;
pub mod packet;
pub mod provider;

use serde::{Deserialize, Serialize};

pub use freshness::should_accept;
pub use packet::{PacketConfig, build_location_packet, has_time_zone_dst_flag};
pub use provider::{LocationCtl, LocationSource, LocationUpdates, StaticLocationSource};

/// A single GPS fix. Immutable value; the session replaces its current
/// sample, it never mutates one in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    /// Latitude in degrees (positive = north)
    pub latitude: f64,
    /// Longitude in degrees (positive = east)
    pub longitude: f64,
    /// Estimated horizontal accuracy radius in meters
    pub accuracy_m: f64,
    /// Fix timestamp in milliseconds since the Unix epoch
    pub fix_time_ms: i64,
    /// Name of the provider that produced the fix
    pub provider: String,
}
