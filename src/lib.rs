#![deny(missing_docs)]
#![allow(clippy::missing_safety_doc)]

//! Real-time safe client, IO and per-app volume core of a virtual output device.
//!
//! A [`Device`](device::Device) owns two worker threads (see [`TaskQueue`](task_queue::TaskQueue)):
//! one with a time-constraint policy that performs the swaps real-time readers depend on, and
//! one ordinary thread for bookkeeping that may block. Real-time IO callbacks read the client
//! registry through [`ClientMap`](client_map::ClientMap) without waiting on control-channel
//! writers, and classify the mixed output with an
//! [`AudibleStateDetector`](audible_state::AudibleStateDetector).
//!
//! The `extern "C"` functions in this module let a host shim drive a device.

use std::collections::VecDeque;
use std::ffi::{CStr, CString, c_void};
use std::os::raw::c_char;
use std::ptr;
use std::slice;
use std::sync::{Arc, Once};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, warn};

#[cfg(target_os = "macos")]
use coreaudio_sys::{
    OSStatus, kAudioHardwareBadObjectError, kAudioHardwareIllegalOperationError,
    kAudioHardwareNoError, kAudioHardwareUnspecifiedError,
};

pub mod app_volumes;
pub(crate) mod atomic_stack;
pub mod audible_state;
pub mod client;
pub mod client_map;
pub mod clients;
pub mod clock;
pub mod config;
/// Developer-facing console and simulated host.
pub mod control;
pub mod device;
pub mod error;
pub mod property;
pub(crate) mod semaphore;
pub mod task_queue;
pub mod volume_curve;

#[cfg(test)]
mod tests;

pub use app_volumes::{AppVolume, AppVolumeController};
pub use audible_state::{AudibleState, AudibleStateDetector};
pub use client::{BundleId, Client, ClientId, ProcessId};
pub use config::{DeviceConfig, TaskQueueConfig};
pub use device::{Device, DeviceStatus, IoOperation};
pub use error::{ClientError, DeviceError, TaskQueueError, VolumeError};
pub use property::{
    ChannelNotifier, EnabledOutputControls, HostNotifier, NullNotifier, ObjectId, Property,
    PropertyValue,
};

/// HAL status code returned by the C entry points.
#[cfg(not(target_os = "macos"))]
pub type OSStatus = i32;

#[cfg(not(target_os = "macos"))]
#[allow(non_upper_case_globals)]
mod hal_status {
    use crate::audible_state::four_cc;

    pub const kAudioHardwareNoError: u32 = 0;
    pub const kAudioHardwareUnspecifiedError: u32 = four_cc(b"what");
    pub const kAudioHardwareIllegalOperationError: u32 = four_cc(b"nope");
    pub const kAudioHardwareBadObjectError: u32 = four_cc(b"!obj");
}

#[cfg(not(target_os = "macos"))]
use hal_status::{
    kAudioHardwareBadObjectError, kAudioHardwareIllegalOperationError, kAudioHardwareNoError,
    kAudioHardwareUnspecifiedError,
};

const LOG_CAPACITY: usize = 256;

static LOG_BUFFER: Lazy<Mutex<VecDeque<String>>> =
    Lazy::new(|| Mutex::new(VecDeque::with_capacity(64)));
static LOG_CACHE: Lazy<Mutex<Option<CString>>> = Lazy::new(|| Mutex::new(None));
static TRACING_INIT: Once = Once::new();

/// Install the fmt subscriber unless the process already has one.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

pub(crate) fn push_log(line: impl Into<String>) {
    let mut guard = LOG_BUFFER.lock();
    guard.push_back(line.into());
    while guard.len() > LOG_CAPACITY {
        guard.pop_front();
    }
}

/// Take the oldest line from the diagnostics log ring.
pub fn pop_log() -> Option<String> {
    LOG_BUFFER.lock().pop_front()
}

/// A device owned by a host shim.
pub struct DeviceHandle {
    device: Arc<device::Device>,
}

impl DeviceHandle {
    /// The wrapped device.
    pub fn device(&self) -> &Arc<device::Device> {
        &self.device
    }
}

/// Called from the non-real-time worker whenever a device property changes.
pub type PropertyChangedCallback =
    extern "C" fn(context: *mut c_void, device: ObjectId, selector: u32);

fn status(code: u32) -> OSStatus {
    code as OSStatus
}

fn translate_status(result: Result<(), DeviceError>) -> OSStatus {
    match result {
        Ok(()) => status(kAudioHardwareNoError),
        Err(err) => {
            push_log(format!("error: {err}"));
            match err {
                DeviceError::Client(ClientError::InvalidClient(_)) => {
                    status(kAudioHardwareBadObjectError)
                }
                DeviceError::Client(_)
                | DeviceError::Volume(_)
                | DeviceError::ReadOnlyProperty(_) => status(kAudioHardwareIllegalOperationError),
                DeviceError::TaskQueue(_) => status(kAudioHardwareUnspecifiedError),
            }
        }
    }
}

unsafe fn device_ref<'a>(handle: *const DeviceHandle) -> Option<&'a device::Device> {
    unsafe { handle.as_ref() }.map(|h| h.device.as_ref())
}

unsafe fn optional_str<'a>(raw: *const c_char) -> Result<Option<&'a str>, OSStatus> {
    if raw.is_null() {
        return Ok(None);
    }
    unsafe { CStr::from_ptr(raw) }
        .to_str()
        .map(Some)
        .map_err(|_| status(kAudioHardwareIllegalOperationError))
}

/// Create a device with the default configuration. `callback` may be null, in which case
/// property notifications are dropped. Returns null if the worker threads cannot be started.
#[unsafe(no_mangle)]
pub extern "C" fn volume_kit_device_create(
    callback: Option<PropertyChangedCallback>,
    context: *mut c_void,
) -> *mut DeviceHandle {
    init_tracing();
    let notifier: Arc<dyn HostNotifier> = match callback {
        Some(callback) => Arc::new(property::CallbackNotifier { callback, context }),
        None => Arc::new(NullNotifier),
    };
    match device::Device::new(DeviceConfig::default(), notifier) {
        Ok(device) => {
            push_log("device created");
            Box::into_raw(Box::new(DeviceHandle { device }))
        }
        Err(err) => {
            warn!(error = %err, "failed to create device");
            push_log(format!("failed to create device: {err}"));
            ptr::null_mut()
        }
    }
}

/// Destroy a device created by [`volume_kit_device_create`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn volume_kit_device_destroy(handle: *mut DeviceHandle) {
    if !handle.is_null() {
        unsafe {
            drop(Box::from_raw(handle));
        }
        push_log("device destroyed");
    }
}

/// A client connected. `bundle_id` may be null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn volume_kit_add_client(
    handle: *const DeviceHandle,
    client_id: ClientId,
    process_id: ProcessId,
    bundle_id: *const c_char,
    is_native_endian: bool,
) -> OSStatus {
    let Some(device) = (unsafe { device_ref(handle) }) else {
        return status(kAudioHardwareBadObjectError);
    };
    let bundle_id = match unsafe { optional_str(bundle_id) } {
        Ok(bundle_id) => bundle_id,
        Err(code) => return code,
    };
    let client = Client::new(client_id, process_id, bundle_id, is_native_endian);
    translate_status(device.add_client(client))
}

/// A client disconnected.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn volume_kit_remove_client(
    handle: *const DeviceHandle,
    client_id: ClientId,
) -> OSStatus {
    let Some(device) = (unsafe { device_ref(handle) }) else {
        return status(kAudioHardwareBadObjectError);
    };
    translate_status(device.remove_client(client_id).map(|_| ()))
}

/// A client starts IO.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn volume_kit_start_io(
    handle: *const DeviceHandle,
    client_id: ClientId,
) -> OSStatus {
    let Some(device) = (unsafe { device_ref(handle) }) else {
        return status(kAudioHardwareBadObjectError);
    };
    translate_status(device.start_io(client_id))
}

/// A client stops IO.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn volume_kit_stop_io(
    handle: *const DeviceHandle,
    client_id: ClientId,
) -> OSStatus {
    let Some(device) = (unsafe { device_ref(handle) }) else {
        return status(kAudioHardwareBadObjectError);
    };
    translate_status(device.stop_io(client_id))
}

/// Called on the IO thread before `operation`, a four-character code.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn volume_kit_begin_io_operation(
    handle: *const DeviceHandle,
    client_id: ClientId,
    operation: u32,
) -> OSStatus {
    let Some(device) = (unsafe { device_ref(handle) }) else {
        return status(kAudioHardwareBadObjectError);
    };
    if let Some(operation) = IoOperation::from_code(operation) {
        device.begin_io_operation(client_id, operation);
    }
    status(kAudioHardwareNoError)
}

/// Called on the IO thread after `operation`, a four-character code.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn volume_kit_end_io_operation(
    handle: *const DeviceHandle,
    client_id: ClientId,
    operation: u32,
) -> OSStatus {
    let Some(device) = (unsafe { device_ref(handle) }) else {
        return status(kAudioHardwareBadObjectError);
    };
    if let Some(operation) = IoOperation::from_code(operation) {
        device.end_io_operation(client_id, operation);
    }
    status(kAudioHardwareNoError)
}

/// Process `frames` frames of a client's interleaved stereo output in place.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn volume_kit_process_output(
    handle: *const DeviceHandle,
    client_id: ClientId,
    frames: u32,
    sample_time: f64,
    buffer: *mut f32,
) -> OSStatus {
    let Some(device) = (unsafe { device_ref(handle) }) else {
        return status(kAudioHardwareBadObjectError);
    };
    if buffer.is_null() {
        return status(kAudioHardwareIllegalOperationError);
    }
    let samples = unsafe { slice::from_raw_parts_mut(buffer, frames as usize * 2) };
    device.process_output(client_id, frames, sample_time, samples);
    status(kAudioHardwareNoError)
}

/// Record `frames` frames of the mixed interleaved stereo output.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn volume_kit_write_mix(
    handle: *const DeviceHandle,
    frames: u32,
    sample_time: f64,
    buffer: *const f32,
) -> OSStatus {
    let Some(device) = (unsafe { device_ref(handle) }) else {
        return status(kAudioHardwareBadObjectError);
    };
    if buffer.is_null() {
        return status(kAudioHardwareIllegalOperationError);
    }
    let samples = unsafe { slice::from_raw_parts(buffer, frames as usize * 2) };
    device.write_mix(frames, sample_time, samples);
    status(kAudioHardwareNoError)
}

/// Set the music player by process id. 0 clears it.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn volume_kit_set_music_player_pid(
    handle: *const DeviceHandle,
    process_id: ProcessId,
) -> OSStatus {
    let Some(device) = (unsafe { device_ref(handle) }) else {
        return status(kAudioHardwareBadObjectError);
    };
    translate_status(device.set_property(PropertyValue::MusicPlayerProcessId(process_id)))
}

/// Read the music player's process id, 0 when it is not set by process id.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn volume_kit_get_music_player_pid(
    handle: *const DeviceHandle,
    out_process_id: *mut ProcessId,
) -> OSStatus {
    let Some(device) = (unsafe { device_ref(handle) }) else {
        return status(kAudioHardwareBadObjectError);
    };
    if out_process_id.is_null() {
        return status(kAudioHardwareIllegalOperationError);
    }
    unsafe {
        *out_process_id = device.clients().music_player_pid();
    }
    status(kAudioHardwareNoError)
}

/// Set the music player by bundle id. Null or empty clears it.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn volume_kit_set_music_player_bundle_id(
    handle: *const DeviceHandle,
    bundle_id: *const c_char,
) -> OSStatus {
    let Some(device) = (unsafe { device_ref(handle) }) else {
        return status(kAudioHardwareBadObjectError);
    };
    let bundle_id = match unsafe { optional_str(bundle_id) } {
        Ok(bundle_id) => bundle_id.unwrap_or_default().to_owned(),
        Err(code) => return code,
    };
    translate_status(device.set_property(PropertyValue::MusicPlayerBundleId(bundle_id)))
}

/// Submit one app volume record through the control channel. `bundle_id` may be null; the
/// volume and pan are only applied when their `has_*` flag is set. Out-of-range values are
/// rejected.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn volume_kit_set_app_volume(
    handle: *const DeviceHandle,
    process_id: ProcessId,
    bundle_id: *const c_char,
    has_volume: bool,
    relative_volume: i32,
    has_pan: bool,
    pan_position: i32,
) -> OSStatus {
    let Some(device) = (unsafe { device_ref(handle) }) else {
        return status(kAudioHardwareBadObjectError);
    };
    let bundle_id = match unsafe { optional_str(bundle_id) } {
        Ok(bundle_id) => bundle_id,
        Err(code) => return code,
    };
    let record = AppVolume {
        process_id: Some(process_id),
        bundle_id: bundle_id.map(str::to_owned),
        relative_volume: has_volume.then_some(relative_volume),
        pan_position: has_pan.then_some(pan_position),
    };
    debug!(?record, "app volume from host");
    translate_status(device.set_property(PropertyValue::AppVolumes(vec![record])))
}

/// Read the audible state as its four-character code.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn volume_kit_get_audible_state(
    handle: *const DeviceHandle,
    out_state: *mut u32,
) -> OSStatus {
    let Some(device) = (unsafe { device_ref(handle) }) else {
        return status(kAudioHardwareBadObjectError);
    };
    if out_state.is_null() {
        return status(kAudioHardwareIllegalOperationError);
    }
    unsafe {
        *out_state = device.audible_state().code();
    }
    status(kAudioHardwareNoError)
}

/// Read whether a client other than the companion app is doing IO.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn volume_kit_get_running_somewhere_other_than_app(
    handle: *const DeviceHandle,
    out_running: *mut bool,
) -> OSStatus {
    let Some(device) = (unsafe { device_ref(handle) }) else {
        return status(kAudioHardwareBadObjectError);
    };
    if out_running.is_null() {
        return status(kAudioHardwareIllegalOperationError);
    }
    unsafe {
        *out_running = device.clients().clients_running_io_other_than_app();
    }
    status(kAudioHardwareNoError)
}

/// Pop the next diagnostics line. Returns `NULL` when no lines remain. The pointer stays valid
/// until the next call.
#[unsafe(no_mangle)]
pub extern "C" fn volume_kit_pop_log() -> *const c_char {
    if let Some(message) = pop_log() {
        let mut cache = LOG_CACHE.lock();
        *cache = Some(CString::new(message).unwrap_or_default());
        cache.as_ref().map(|c| c.as_ptr()).unwrap_or(ptr::null())
    } else {
        ptr::null()
    }
}
