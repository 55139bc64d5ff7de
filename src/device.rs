//! The device as the host sees it: client lifecycle, IO callbacks and properties.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use dasp_frame::{Frame, Stereo};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::app_volumes::{AppVolume, MAX_PAN};
use crate::audible_state::{AudibleState, AudibleStateDetector, four_cc};
use crate::client::{Client, ClientId, DEFAULT_PAN_POSITION, DEFAULT_RELATIVE_VOLUME};
use crate::clients::{Clients, IoCounts};
use crate::config::DeviceConfig;
use crate::error::{ClientError, DeviceError};
use crate::property::{EnabledOutputControls, HostNotifier, ObjectId, Property, PropertyValue};
use crate::push_log;
use crate::task_queue::TaskQueue;

/// IO operations a client announces around its IO.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoOperation {
    /// The client's IO thread starts or stops.
    Thread = four_cc(b"thrd"),
    /// One IO cycle.
    Cycle = four_cc(b"cycl"),
    /// The client's output is processed.
    ProcessOutput = four_cc(b"pout"),
    /// The mix is written.
    WriteMix = four_cc(b"mixo"),
}

impl IoOperation {
    /// Parse a four-character operation code.
    pub fn from_code(code: u32) -> Option<Self> {
        [Self::Thread, Self::Cycle, Self::ProcessOutput, Self::WriteMix]
            .into_iter()
            .find(|op| *op as u32 == code)
    }
}

struct IoState {
    audible: AudibleStateDetector,
}

/// Snapshot of the device for diagnostics.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceStatus {
    /// Connected clients ordered by id.
    pub clients: Vec<Client>,
    /// IO counters.
    pub io_counts: IoCounts,
    /// Whether the device is doing IO.
    pub is_running: bool,
    /// Current audible state.
    pub audible_state: AudibleState,
    /// Music player process id, 0 when not set by pid.
    pub music_player_pid: i32,
    /// Music player bundle id, empty when not set by bundle id.
    pub music_player_bundle_id: String,
    /// Apps with non-default volume or pan.
    pub app_volumes: Vec<AppVolume>,
    /// Unused async task nodes.
    pub free_tasks: usize,
}

/// A virtual output device.
pub struct Device {
    config: DeviceConfig,
    task_queue: Arc<TaskQueue>,
    clients: Arc<Clients>,
    io: Mutex<IoState>,
    audible_state: AtomicU32,
    reset_audible_state: AtomicBool,
    controls: Mutex<EnabledOutputControls>,
}

impl Device {
    /// Start the worker threads and create a device with no clients.
    pub fn new(config: DeviceConfig, notifier: Arc<dyn HostNotifier>) -> Result<Arc<Self>, DeviceError> {
        let task_queue = Arc::new(TaskQueue::new(config.task_queue.clone(), notifier)?);
        let clients = Arc::new(Clients::new(
            config.device_id,
            &config.app_bundle_id,
            Arc::clone(&task_queue),
        ));
        info!(device_id = config.device_id, "device created");
        Ok(Arc::new(Self {
            io: Mutex::new(IoState {
                audible: AudibleStateDetector::new(config.audible_hysteresis_frames),
            }),
            audible_state: AtomicU32::new(AudibleState::Silent.code()),
            reset_audible_state: AtomicBool::new(false),
            controls: Mutex::new(EnabledOutputControls::default()),
            config,
            task_queue,
            clients,
        }))
    }

    /// Object id of the device.
    pub fn object_id(&self) -> ObjectId {
        self.config.device_id
    }

    /// The device's clients.
    pub fn clients(&self) -> &Arc<Clients> {
        &self.clients
    }

    /// The device's worker threads.
    pub fn task_queue(&self) -> &Arc<TaskQueue> {
        &self.task_queue
    }

    /// A client connected.
    pub fn add_client(&self, client: Client) -> Result<(), DeviceError> {
        push_log(format!("client {} connected", client.client_id));
        Ok(self.clients.add_client(client)?)
    }

    /// A client disconnected.
    pub fn remove_client(&self, client_id: ClientId) -> Result<Client, DeviceError> {
        let removed = self.clients.remove_client(client_id)?;
        push_log(format!("client {client_id} disconnected"));
        if removed.doing_io && !self.clients.clients_running_io() {
            self.stop_hardware();
        }
        Ok(removed)
    }

    /// A client wants to start IO. Starts the device's IO if it is the first.
    pub fn start_io(&self, client_id: ClientId) -> Result<(), DeviceError> {
        self.require_client(client_id)?;
        if self
            .task_queue
            .queue_sync_start_client_io(&self.clients, client_id)
        {
            self.start_hardware();
        }
        Ok(())
    }

    /// A client stopped IO. Stops the device's IO if it was the last.
    pub fn stop_io(&self, client_id: ClientId) -> Result<(), DeviceError> {
        self.require_client(client_id)?;
        if self
            .task_queue
            .queue_sync_stop_client_io(&self.clients, client_id)
        {
            self.stop_hardware();
        }
        Ok(())
    }

    fn require_client(&self, client_id: ClientId) -> Result<(), ClientError> {
        match self.clients.client_map().get_client_non_rt(client_id) {
            Some(_) => Ok(()),
            None => Err(ClientError::InvalidClient(client_id)),
        }
    }

    fn start_hardware(&self) {
        // The IO thread resets its detector before the next cycle.
        self.reset_audible_state.store(true, Ordering::Release);
        self.audible_state
            .store(AudibleState::Silent.code(), Ordering::Release);
        info!(device_id = self.config.device_id, "device IO started");
        push_log("device IO started");
    }

    fn stop_hardware(&self) {
        info!(device_id = self.config.device_id, "device IO stopped");
        push_log("device IO stopped");
    }

    /// Called on the IO thread before an operation.
    pub fn begin_io_operation(&self, client_id: ClientId, operation: IoOperation) {
        if operation == IoOperation::Thread {
            self.task_queue
                .queue_async_start_client_io(&self.clients, client_id);
        }
    }

    /// Called on the IO thread after an operation.
    pub fn end_io_operation(&self, client_id: ClientId, operation: IoOperation) {
        if operation == IoOperation::Thread {
            self.task_queue
                .queue_async_stop_client_io(&self.clients, client_id);
        }
    }

    /// Process one client's interleaved stereo output in place: feed it to the audible state
    /// detector, then apply the client's relative volume and pan.
    pub fn process_output(&self, client_id: ClientId, frames: u32, sample_time: f64, buffer: &mut [f32]) {
        let (is_music_player, volume, pan) = self
            .clients
            .client_map()
            .with_client_rt(client_id, |c| (c.is_music_player, c.relative_volume, c.pan_position))
            .unwrap_or((false, DEFAULT_RELATIVE_VOLUME, DEFAULT_PAN_POSITION));

        self.io_state()
            .audible
            .update_with_client_io(is_music_player, frames, sample_time, buffer);

        apply_volume_and_pan(frames, buffer, volume, pan);
    }

    /// Record the mixed output of one cycle. Returns `true` if the audible state changed, in
    /// which case a notification has been queued.
    pub fn write_mix(&self, frames: u32, sample_time: f64, buffer: &[f32]) -> bool {
        let mut io = self.io_state();
        if !io.audible.update_with_mixed_io(frames, sample_time, buffer) {
            return false;
        }
        self.audible_state
            .store(io.audible.state().code(), Ordering::Release);
        drop(io);
        self.task_queue
            .queue_async_send_property_notification(Property::AudibleState, self.config.device_id);
        true
    }

    /// IO thread state, with the audible state detector reset if IO restarted since the last
    /// cycle.
    fn io_state(&self) -> MutexGuard<'_, IoState> {
        let mut io = self.io.lock();
        if self.reset_audible_state.swap(false, Ordering::AcqRel) {
            io.audible.reset();
        }
        io
    }

    /// Current audible state.
    pub fn audible_state(&self) -> AudibleState {
        AudibleState::from_code(self.audible_state.load(Ordering::Acquire))
            .unwrap_or(AudibleState::Silent)
    }

    /// Whether any client is doing IO.
    pub fn is_running(&self) -> bool {
        self.clients.clients_running_io()
    }

    /// Read a property.
    pub fn property(&self, property: Property) -> PropertyValue {
        match property {
            Property::IsRunning => PropertyValue::IsRunning(self.is_running()),
            Property::MusicPlayerProcessId => {
                PropertyValue::MusicPlayerProcessId(self.clients.music_player_pid())
            }
            Property::MusicPlayerBundleId => {
                PropertyValue::MusicPlayerBundleId(self.clients.music_player_bundle_id())
            }
            Property::AudibleState => PropertyValue::AudibleState(self.audible_state()),
            Property::RunningSomewhereOtherThanApp => PropertyValue::RunningSomewhereOtherThanApp(
                self.clients.clients_running_io_other_than_app(),
            ),
            Property::AppVolumes => PropertyValue::AppVolumes(self.clients.app_volumes()),
            Property::EnabledOutputControls => {
                PropertyValue::EnabledOutputControls(*self.controls.lock())
            }
        }
    }

    /// Write a property. Observers are notified if the value changed.
    pub fn set_property(&self, value: PropertyValue) -> Result<(), DeviceError> {
        let property = value.property();
        if !property.is_settable() {
            return Err(DeviceError::ReadOnlyProperty(property));
        }
        let mut controls = self.controls.lock();
        let changed: &[Property] = match value {
            PropertyValue::MusicPlayerProcessId(pid) => {
                if self.clients.set_music_player_pid(pid)? {
                    &[Property::MusicPlayerProcessId, Property::MusicPlayerBundleId]
                } else {
                    &[]
                }
            }
            PropertyValue::MusicPlayerBundleId(bundle_id) => {
                if self.clients.set_music_player_bundle_id(&bundle_id) {
                    &[Property::MusicPlayerBundleId, Property::MusicPlayerProcessId]
                } else {
                    &[]
                }
            }
            PropertyValue::AppVolumes(records) => {
                if self.clients.set_clients_relative_volumes(&records)? {
                    &[Property::AppVolumes]
                } else {
                    &[]
                }
            }
            PropertyValue::EnabledOutputControls(enabled) => {
                if *controls != enabled {
                    *controls = enabled;
                    &[Property::EnabledOutputControls]
                } else {
                    &[]
                }
            }
            _ => return Err(DeviceError::ReadOnlyProperty(property)),
        };
        drop(controls);

        debug!(%property, notified = changed.len(), "property set");
        for property in changed {
            self.task_queue
                .queue_async_send_property_notification(*property, self.config.device_id);
        }
        Ok(())
    }

    /// Snapshot for diagnostics.
    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            clients: self.clients.client_map().clients(),
            io_counts: self.clients.io_counts(),
            is_running: self.is_running(),
            audible_state: self.audible_state(),
            music_player_pid: self.clients.music_player_pid(),
            music_player_bundle_id: self.clients.music_player_bundle_id(),
            app_volumes: self.clients.app_volumes(),
            free_tasks: self.task_queue.free_tasks(),
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Workers may hold references to the clients; stop them while this thread still owns
        // the last references.
        self.task_queue.shutdown();
        debug!(device_id = self.config.device_id, "device dropped");
    }
}

/// Left and right gains for a raw pan position. The side being panned away from is
/// attenuated linearly; the other side is left alone.
pub fn pan_gains(pan: i32) -> Stereo<f32> {
    let amount = pan.clamp(-MAX_PAN, MAX_PAN) as f32 / MAX_PAN as f32;
    if amount > 0.0 {
        [1.0 - amount, 1.0]
    } else {
        [1.0, 1.0 + amount]
    }
}

/// Scale an interleaved stereo buffer by `volume`, pan it, and clamp it to `-1.0..=1.0`.
pub fn apply_volume_and_pan(frames: u32, buffer: &mut [f32], volume: f32, pan: i32) {
    if volume == DEFAULT_RELATIVE_VOLUME && pan == DEFAULT_PAN_POSITION {
        return;
    }
    let gains = pan_gains(pan);
    let len = (frames as usize * 2).min(buffer.len() - buffer.len() % 2);
    for samples in buffer[..len].chunks_exact_mut(2) {
        let frame: Stereo<f32> = [samples[0], samples[1]];
        let out = frame.scale_amp(volume).mul_amp(gains);
        samples[0] = out[0].clamp(-1.0, 1.0);
        samples[1] = out[1].clamp(-1.0, 1.0);
    }
}
