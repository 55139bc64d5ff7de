use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, bounded};

use crate::app_volumes::{AppVolumeController, MAX_PAN, MAX_RAW_VOLUME, MIN_PAN, MIN_RAW_VOLUME};
use crate::client::{Client, MAX_RELATIVE_VOLUME};
use crate::device::{Device, DeviceStatus};
use crate::error::DeviceError;
use crate::property::PropertyValue;

/// Poll `device.status()` every `interval` on a background thread. The thread exits once the
/// receiver is dropped.
pub fn spawn_status_poller(device: Arc<Device>, interval: Duration) -> Receiver<DeviceStatus> {
    let (status_tx, status_rx) = bounded(4);
    thread::spawn(move || {
        loop {
            if status_tx.send(device.status()).is_err() {
                break;
            }
            thread::sleep(interval);
        }
    });
    status_rx
}

/// A client's relative volume as a raw `0..=100` value.
pub fn raw_volume(device: &Device, client: &Client) -> i32 {
    device
        .clients()
        .volume_curve()
        .scalar_to_raw(client.relative_volume / MAX_RELATIVE_VOLUME)
}

/// Change a client's app volume by `delta` raw steps.
pub fn nudge_volume(device: &Arc<Device>, client: &Client, delta: i32) -> Result<i32, DeviceError> {
    let target = (raw_volume(device, client) + delta).clamp(MIN_RAW_VOLUME, MAX_RAW_VOLUME);
    AppVolumeController::new(Arc::clone(device)).set_app_volume(
        client.process_id,
        client.bundle_id_str(),
        target,
    )?;
    Ok(target)
}

/// Change a client's pan position by `delta`.
pub fn nudge_pan(device: &Arc<Device>, client: &Client, delta: i32) -> Result<i32, DeviceError> {
    let target = (client.pan_position + delta).clamp(MIN_PAN, MAX_PAN);
    AppVolumeController::new(Arc::clone(device)).set_app_pan_position(
        client.process_id,
        client.bundle_id_str(),
        target,
    )?;
    Ok(target)
}

/// Make a client the music player, by bundle id when it has one.
pub fn make_music_player(device: &Device, client: &Client) -> Result<(), DeviceError> {
    let value = match client.bundle_id_str() {
        Some(bundle_id) => PropertyValue::MusicPlayerBundleId(bundle_id.to_owned()),
        None => PropertyValue::MusicPlayerProcessId(client.process_id),
    };
    device.set_property(value)
}

/// Start a client's IO if it is stopped, stop it otherwise. Returns whether it now does IO.
pub fn toggle_io(device: &Device, client: &Client) -> Result<bool, DeviceError> {
    if client.doing_io {
        device.stop_io(client.client_id)?;
        Ok(false)
    } else {
        device.start_io(client.client_id)?;
        Ok(true)
    }
}
