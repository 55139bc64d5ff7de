//! Device properties exposed to the control channel and the host notification sink.
use std::fmt;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::app_volumes::AppVolume;
use crate::audible_state::{AudibleState, four_cc};
use crate::client::ProcessId;

/// Audio object id assigned by the host.
pub type ObjectId = u32;

/// Device properties handled by the core.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Property {
    /// Whether the device is doing IO for any client.
    IsRunning = four_cc(b"goin"),
    /// Process id of the music player, 0 when unset.
    MusicPlayerProcessId = four_cc(b"mppi"),
    /// Bundle id of the music player, empty when unset.
    MusicPlayerBundleId = four_cc(b"mpbi"),
    /// See [`AudibleState`].
    AudibleState = four_cc(b"daud"),
    /// Whether a client other than the companion app is doing IO.
    RunningSomewhereOtherThanApp = four_cc(b"runo"),
    /// Per-app volume and pan records.
    AppVolumes = four_cc(b"apvs"),
    /// Which output controls the device publishes.
    EnabledOutputControls = four_cc(b"bgct"),
}

impl Property {
    /// Four-character selector of the property.
    pub fn selector(self) -> u32 {
        self as u32
    }

    /// Whether the control channel may write the property.
    pub fn is_settable(self) -> bool {
        matches!(
            self,
            Property::MusicPlayerProcessId
                | Property::MusicPlayerBundleId
                | Property::AppVolumes
                | Property::EnabledOutputControls
        )
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.selector().to_be_bytes();
        write!(f, "'{}'", String::from_utf8_lossy(&bytes))
    }
}

/// Output controls the device exposes to the system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnabledOutputControls {
    /// Master volume control.
    pub volume: bool,
    /// Master mute control.
    pub mute: bool,
}

impl Default for EnabledOutputControls {
    fn default() -> Self {
        Self {
            volume: true,
            mute: true,
        }
    }
}

/// Typed value of a [`Property`].
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    /// [`Property::IsRunning`]
    IsRunning(bool),
    /// [`Property::MusicPlayerProcessId`]
    MusicPlayerProcessId(ProcessId),
    /// [`Property::MusicPlayerBundleId`]
    MusicPlayerBundleId(String),
    /// [`Property::AudibleState`]
    AudibleState(AudibleState),
    /// [`Property::RunningSomewhereOtherThanApp`]
    RunningSomewhereOtherThanApp(bool),
    /// [`Property::AppVolumes`]
    AppVolumes(Vec<AppVolume>),
    /// [`Property::EnabledOutputControls`]
    EnabledOutputControls(EnabledOutputControls),
}

impl PropertyValue {
    /// Property this value belongs to.
    pub fn property(&self) -> Property {
        match self {
            PropertyValue::IsRunning(_) => Property::IsRunning,
            PropertyValue::MusicPlayerProcessId(_) => Property::MusicPlayerProcessId,
            PropertyValue::MusicPlayerBundleId(_) => Property::MusicPlayerBundleId,
            PropertyValue::AudibleState(_) => Property::AudibleState,
            PropertyValue::RunningSomewhereOtherThanApp(_) => Property::RunningSomewhereOtherThanApp,
            PropertyValue::AppVolumes(_) => Property::AppVolumes,
            PropertyValue::EnabledOutputControls(_) => Property::EnabledOutputControls,
        }
    }
}

/// Receives property-changed notifications. Always called from the non-real-time worker
/// thread.
pub trait HostNotifier: Send + Sync {
    /// One or more properties of `device` changed.
    fn properties_changed(&self, device: ObjectId, properties: &[Property]);
}

/// Notifier that drops every notification.
#[derive(Debug, Default)]
pub struct NullNotifier;

impl HostNotifier for NullNotifier {
    fn properties_changed(&self, _device: ObjectId, _properties: &[Property]) {}
}

/// Notifier that forwards notifications into a channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: Sender<(ObjectId, Property)>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiving end of its channel.
    pub fn new() -> (Self, Receiver<(ObjectId, Property)>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }
}

impl HostNotifier for ChannelNotifier {
    fn properties_changed(&self, device: ObjectId, properties: &[Property]) {
        for property in properties {
            // The receiver going away just means nobody is listening any more.
            let _ = self.sender.send((device, *property));
        }
    }
}

/// Notifier backed by a C callback, used by the host shim.
pub(crate) struct CallbackNotifier {
    pub(crate) callback: extern "C" fn(context: *mut std::ffi::c_void, device: ObjectId, selector: u32),
    pub(crate) context: *mut std::ffi::c_void,
}

// The host shim promises the context may be used from any thread.
unsafe impl Send for CallbackNotifier {}
unsafe impl Sync for CallbackNotifier {}

impl HostNotifier for CallbackNotifier {
    fn properties_changed(&self, device: ObjectId, properties: &[Property]) {
        for property in properties {
            (self.callback)(self.context, device, property.selector());
        }
    }
}
