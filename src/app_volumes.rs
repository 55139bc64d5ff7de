//! App volume records and the companion-app side volume controls.
use std::sync::Arc;

use once_cell::sync::Lazy;
use tracing::{debug, warn};

use crate::client::ProcessId;
use crate::device::Device;
use crate::error::DeviceError;
use crate::property::PropertyValue;

/// Smallest raw relative volume.
pub const MIN_RAW_VOLUME: i32 = 0;
/// Largest raw relative volume.
pub const MAX_RAW_VOLUME: i32 = 100;
/// Raw relative volume that leaves an app unchanged.
pub const UNITY_RAW_VOLUME: i32 = 50;
/// Pan fully left.
pub const MIN_PAN: i32 = -100;
/// Pan fully right.
pub const MAX_PAN: i32 = 100;
/// Process id matching no client, so a record applies by bundle id only.
pub const WILDCARD_PID: ProcessId = -1;

/// Volume and/or pan of one app as exchanged with the control channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppVolume {
    /// Process id of the app.
    pub process_id: Option<ProcessId>,
    /// Bundle id of the app.
    pub bundle_id: Option<String>,
    /// Raw relative volume, `0..=100`.
    pub relative_volume: Option<i32>,
    /// Raw pan position, `-100..=100`.
    pub pan_position: Option<i32>,
}

impl AppVolume {
    /// Record addressing an app by process id and bundle id.
    pub fn new(process_id: Option<ProcessId>, bundle_id: Option<&str>) -> Self {
        Self {
            process_id,
            bundle_id: bundle_id.map(str::to_owned),
            ..Self::default()
        }
    }

    /// Set the raw relative volume.
    pub fn with_volume(mut self, raw: i32) -> Self {
        self.relative_volume = Some(raw);
        self
    }

    /// Set the raw pan position.
    pub fn with_pan(mut self, pan: i32) -> Self {
        self.pan_position = Some(pan);
        self
    }
}

const PARALLELS_WINAPP_PREFIX: &str = "com.parallels.winapp.";
const PARALLELS_VM: &str = "com.parallels.vm";

static RESPONSIBLE_BUNDLE_IDS: Lazy<Vec<(&'static str, &'static [&'static str])>> = Lazy::new(|| {
    vec![
        ("com.apple.finder", &["com.apple.quicklook.ui.helper"][..]),
        ("com.apple.Safari", &["com.apple.WebKit.WebContent"][..]),
        ("org.mozilla.firefox", &["org.mozilla.plugincontainer"][..]),
        ("org.mozilla.nightly", &["org.mozilla.plugincontainer"][..]),
        ("com.vmware.fusion", &["com.vmware.vmware-vmx"][..]),
        ("com.parallels.desktop.console", &[PARALLELS_VM][..]),
        (
            "hu.mplayerhq.mplayerosx.extended",
            &["ch.sttz.mplayerosx.extended.binaries.officialsvn"][..],
        ),
    ]
});

/// Bundle ids of helper processes that play audio on behalf of `bundle_id`.
///
/// Windows apps shown in the dock by Parallels all play through the Parallels VM process.
pub fn responsible_bundle_ids_of(bundle_id: &str) -> Vec<&'static str> {
    if bundle_id.starts_with(PARALLELS_WINAPP_PREFIX) {
        return vec![PARALLELS_VM];
    }
    RESPONSIBLE_BUNDLE_IDS
        .iter()
        .find(|(parent, _)| *parent == bundle_id)
        .map(|(_, helpers)| helpers.to_vec())
        .unwrap_or_default()
}

/// Records for an app and each of its helper processes. Helpers are addressed by bundle id
/// only, because their process ids are unknown to the app.
pub fn fan_out(record: AppVolume) -> Vec<AppVolume> {
    let helpers = record
        .bundle_id
        .as_deref()
        .map(responsible_bundle_ids_of)
        .unwrap_or_default();
    let mut records = Vec::with_capacity(helpers.len() + 1);
    for helper in helpers {
        records.push(AppVolume {
            process_id: Some(WILDCARD_PID),
            bundle_id: Some(helper.to_owned()),
            ..record.clone()
        });
    }
    records.insert(0, record);
    records
}

/// Per-app volume and pan controls as used by the companion app's UI.
///
/// Unlike the control channel, which rejects out-of-range values, these clamp them into
/// range. Changes addressed to an app are also sent to its helper processes.
pub struct AppVolumeController {
    device: Arc<Device>,
}

impl AppVolumeController {
    /// Controls for `device`.
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }

    /// Set an app's raw relative volume, clamped into `0..=100`.
    pub fn set_app_volume(
        &self,
        process_id: ProcessId,
        bundle_id: Option<&str>,
        raw_volume: i32,
    ) -> Result<(), DeviceError> {
        let clamped = raw_volume.clamp(MIN_RAW_VOLUME, MAX_RAW_VOLUME);
        if clamped != raw_volume {
            warn!(raw_volume, clamped, "app volume out of range, clamping");
        }
        self.send(AppVolume::new(Some(process_id), bundle_id).with_volume(clamped))
    }

    /// Set an app's pan position, clamped into `-100..=100`.
    pub fn set_app_pan_position(
        &self,
        process_id: ProcessId,
        bundle_id: Option<&str>,
        pan: i32,
    ) -> Result<(), DeviceError> {
        let clamped = pan.clamp(MIN_PAN, MAX_PAN);
        if clamped != pan {
            warn!(pan, clamped, "app pan position out of range, clamping");
        }
        self.send(AppVolume::new(Some(process_id), bundle_id).with_pan(clamped))
    }

    fn send(&self, record: AppVolume) -> Result<(), DeviceError> {
        let records = fan_out(record);
        debug!(records = records.len(), "sending app volume change");
        self.device
            .set_property(PropertyValue::AppVolumes(records))
    }
}
