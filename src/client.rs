//! A process connected to the device for audio IO.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Opaque handle the host assigns to each client.
pub type ClientId = u32;

/// Process id of a client. `-1` is used as a wildcard in app volume records.
pub type ProcessId = i32;

/// Relative volume of a client nobody has adjusted.
pub const DEFAULT_RELATIVE_VOLUME: f32 = 1.0;
/// Largest relative volume a client can be boosted to.
pub const MAX_RELATIVE_VOLUME: f32 = 4.0;
/// Centre pan position.
pub const DEFAULT_PAN_POSITION: i32 = 0;

/// Reverse-DNS application identifier.
///
/// Clones share one allocation, so copying a [`Client`] out of the live map on the IO thread
/// never allocates.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BundleId(Arc<str>);

impl BundleId {
    /// Wrap a bundle id. Empty strings are not valid bundle ids.
    pub fn new(id: &str) -> Option<Self> {
        if id.is_empty() {
            None
        } else {
            Some(Self(Arc::from(id)))
        }
    }

    /// Borrow the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for BundleId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// State kept per connected client.
#[derive(Clone, Debug, PartialEq)]
pub struct Client {
    /// Host assigned id, unique among connected clients.
    pub client_id: ClientId,
    /// Owning process. Several clients may share one.
    pub process_id: ProcessId,
    /// Bundle id of the owning process, when it has one.
    pub bundle_id: Option<BundleId>,
    /// Whether the client's samples are in native byte order.
    pub is_native_endian: bool,
    /// Set between the client's start and stop IO calls.
    pub doing_io: bool,
    /// Set when the client matches the configured music player.
    pub is_music_player: bool,
    /// Linear gain applied to the client's output, `0.0..=4.0`.
    pub relative_volume: f32,
    /// Raw pan, `-100` (left) to `100` (right).
    pub pan_position: i32,
}

impl Client {
    /// Describe a newly connected client. An empty bundle id is treated as missing.
    pub fn new(
        client_id: ClientId,
        process_id: ProcessId,
        bundle_id: Option<&str>,
        is_native_endian: bool,
    ) -> Self {
        Self {
            client_id,
            process_id,
            bundle_id: bundle_id.and_then(BundleId::new),
            is_native_endian,
            doing_io: false,
            is_music_player: false,
            relative_volume: DEFAULT_RELATIVE_VOLUME,
            pan_position: DEFAULT_PAN_POSITION,
        }
    }

    /// Bundle id as a string slice.
    pub fn bundle_id_str(&self) -> Option<&str> {
        self.bundle_id.as_ref().map(BundleId::as_str)
    }

    /// Whether the user changed this client's volume or pan away from the defaults.
    pub fn has_custom_volume(&self) -> bool {
        self.relative_volume != DEFAULT_RELATIVE_VOLUME || self.pan_position != DEFAULT_PAN_POSITION
    }
}
