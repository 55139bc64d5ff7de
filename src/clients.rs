//! Client bookkeeping on top of the [`ClientMap`]: IO reference counting, the music player
//! and per-app volumes.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::app_volumes::{AppVolume, MAX_PAN, MAX_RAW_VOLUME, MIN_PAN, MIN_RAW_VOLUME};
use crate::client::{
    BundleId, Client, ClientId, DEFAULT_PAN_POSITION, DEFAULT_RELATIVE_VOLUME, MAX_RELATIVE_VOLUME,
    ProcessId,
};
use crate::client_map::{ClientMap, ClientSelector, MusicPlayer};
use crate::error::{ClientError, VolumeError};
use crate::property::{ObjectId, Property};
use crate::task_queue::TaskQueue;
use crate::volume_curve::VolumeCurve;

#[derive(Debug, Default)]
struct State {
    app_client_id: Option<ClientId>,
    start_count: u64,
    start_count_excluding_app: u64,
    music_player: MusicPlayer,
}

impl State {
    fn is_app(&self, client_id: ClientId) -> bool {
        self.app_client_id == Some(client_id)
    }

    fn check_counts(&self) {
        assert!(
            self.start_count_excluding_app == self.start_count
                || self.start_count_excluding_app + 1 == self.start_count,
            "IO start counts out of sync: total {}, excluding app {}",
            self.start_count,
            self.start_count_excluding_app
        );
    }
}

/// IO counters at one instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IoCounts {
    /// Clients doing IO.
    pub total: u64,
    /// Clients other than the companion app doing IO.
    pub excluding_app: u64,
}

/// Connected clients of one device.
pub struct Clients {
    device_id: ObjectId,
    app_bundle_id: Option<BundleId>,
    task_queue: Arc<TaskQueue>,
    client_map: ClientMap,
    volume_curve: VolumeCurve,
    state: Mutex<State>,
}

impl Clients {
    /// No clients yet. `app_bundle_id` identifies the companion app.
    pub fn new(device_id: ObjectId, app_bundle_id: &str, task_queue: Arc<TaskQueue>) -> Self {
        Self {
            device_id,
            app_bundle_id: BundleId::new(app_bundle_id),
            client_map: ClientMap::new(Arc::clone(&task_queue)),
            task_queue,
            volume_curve: VolumeCurve::app_relative_volume(),
            state: Mutex::new(State::default()),
        }
    }

    /// The underlying registry.
    pub fn client_map(&self) -> &ClientMap {
        &self.client_map
    }

    /// Curve converting raw app volumes into gains.
    pub fn volume_curve(&self) -> &VolumeCurve {
        &self.volume_curve
    }

    /// Register a newly connected client.
    pub fn add_client(&self, mut client: Client) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        client.is_music_player = state.music_player.matches(&client);
        let is_app = client.bundle_id.is_some() && client.bundle_id == self.app_bundle_id;
        let client_id = client.client_id;
        let pid = client.process_id;
        let music_player = client.is_music_player;
        let bundle_id = client.bundle_id.clone();

        self.client_map.add_client(client)?;
        if is_app {
            state.app_client_id = Some(client_id);
        }
        info!(
            client_id,
            pid,
            bundle_id = bundle_id.as_ref().map(BundleId::as_str).unwrap_or_default(),
            music_player,
            "client added"
        );
        Ok(())
    }

    /// Unregister a client and return its final state. A client that disconnects without
    /// stopping IO stops being counted.
    pub fn remove_client(&self, client_id: ClientId) -> Result<Client, ClientError> {
        let mut state = self.state.lock();
        let removed = self.client_map.remove_client(client_id)?;

        let mut did_stop = false;
        let mut running_elsewhere_changed = false;
        if removed.doing_io {
            debug!(client_id, "client disconnected while doing IO");
            state.start_count = state.start_count.saturating_sub(1);
            if !state.is_app(client_id) {
                state.start_count_excluding_app = state.start_count_excluding_app.saturating_sub(1);
                running_elsewhere_changed = state.start_count_excluding_app == 0;
            }
            did_stop = state.start_count == 0;
        }
        if state.is_app(client_id) {
            state.app_client_id = None;
        }
        state.check_counts();
        drop(state);

        info!(client_id, "client removed");
        self.send_io_running_notifications(did_stop, running_elsewhere_changed);
        Ok(removed)
    }

    /// Client id of the companion app, when it is connected.
    pub fn app_client_id(&self) -> Option<ClientId> {
        self.state.lock().app_client_id
    }

    /// Count `client_id` as doing IO. Returns `true` when it is the first client doing IO,
    /// meaning the device has to start IO.
    pub fn start_io_non_rt(&self, client_id: ClientId) -> Result<bool, ClientError> {
        let mut state = self.state.lock();
        let client = self
            .client_map
            .get_client_non_rt(client_id)
            .ok_or(ClientError::InvalidClient(client_id))?;

        let mut did_start = false;
        let mut running_elsewhere_changed = false;
        if !client.doing_io {
            let Some(total) = state.start_count.checked_add(1) else {
                panic!("IO start count overflowed");
            };
            debug!(
                client_id,
                pid = client.process_id,
                bundle_id = client.bundle_id_str().unwrap_or_default(),
                "client starting IO"
            );
            self.client_map.set_doing_io(client_id, true)?;
            state.start_count = total;
            if !state.is_app(client_id) {
                let Some(excluding) = state.start_count_excluding_app.checked_add(1) else {
                    panic!("IO start count excluding the app overflowed");
                };
                state.start_count_excluding_app = excluding;
                running_elsewhere_changed = excluding == 1;
            }
            did_start = total == 1;
        }
        state.check_counts();
        drop(state);

        self.send_io_running_notifications(did_start, running_elsewhere_changed);
        Ok(did_start)
    }

    /// Count `client_id` as no longer doing IO. Returns `true` when it was the last client
    /// doing IO, meaning the device has to stop IO.
    pub fn stop_io_non_rt(&self, client_id: ClientId) -> Result<bool, ClientError> {
        let mut state = self.state.lock();
        let client = self
            .client_map
            .get_client_non_rt(client_id)
            .ok_or(ClientError::InvalidClient(client_id))?;

        let mut did_stop = false;
        let mut running_elsewhere_changed = false;
        if client.doing_io {
            let Some(total) = state.start_count.checked_sub(1) else {
                panic!("IO start count underflowed");
            };
            debug!(client_id, pid = client.process_id, "client stopping IO");
            self.client_map.set_doing_io(client_id, false)?;
            state.start_count = total;
            if !state.is_app(client_id) {
                let Some(excluding) = state.start_count_excluding_app.checked_sub(1) else {
                    panic!("IO start count excluding the app underflowed");
                };
                state.start_count_excluding_app = excluding;
                running_elsewhere_changed = excluding == 0;
            }
            did_stop = total == 0;
        }
        state.check_counts();
        drop(state);

        self.send_io_running_notifications(did_stop, running_elsewhere_changed);
        Ok(did_stop)
    }

    fn send_io_running_notifications(&self, is_running: bool, running_elsewhere: bool) {
        if is_running {
            self.task_queue
                .queue_async_send_property_notification(Property::IsRunning, self.device_id);
        }
        if running_elsewhere {
            self.task_queue.queue_async_send_property_notification(
                Property::RunningSomewhereOtherThanApp,
                self.device_id,
            );
        }
    }

    /// Current IO counters.
    pub fn io_counts(&self) -> IoCounts {
        let state = self.state.lock();
        IoCounts {
            total: state.start_count,
            excluding_app: state.start_count_excluding_app,
        }
    }

    /// Whether any client is doing IO.
    pub fn clients_running_io(&self) -> bool {
        self.state.lock().start_count > 0
    }

    /// Whether any client other than the companion app is doing IO.
    pub fn clients_running_io_other_than_app(&self) -> bool {
        self.state.lock().start_count_excluding_app > 0
    }

    /// Set the music player by process id, clearing any bundle id. `0` unsets it. Returns
    /// whether the setting changed.
    pub fn set_music_player_pid(&self, pid: ProcessId) -> Result<bool, ClientError> {
        if pid < 0 {
            return Err(ClientError::InvalidProcessId(pid));
        }
        let music_player = if pid == 0 {
            MusicPlayer::Unset
        } else {
            MusicPlayer::ProcessId(pid)
        };
        Ok(self.set_music_player(music_player))
    }

    /// Set the music player by bundle id, clearing any process id. An empty string unsets it.
    /// Returns whether the setting changed.
    pub fn set_music_player_bundle_id(&self, bundle_id: &str) -> bool {
        let music_player = BundleId::new(bundle_id).map_or(MusicPlayer::Unset, MusicPlayer::BundleId);
        self.set_music_player(music_player)
    }

    fn set_music_player(&self, music_player: MusicPlayer) -> bool {
        let mut state = self.state.lock();
        if state.music_player == music_player {
            return false;
        }
        info!(?music_player, "music player changed");
        self.client_map.update_music_player_flags(&music_player);
        state.music_player = music_player;
        true
    }

    /// The music player's process id, `0` if it is not set by process id.
    pub fn music_player_pid(&self) -> ProcessId {
        match &self.state.lock().music_player {
            MusicPlayer::ProcessId(pid) => *pid,
            _ => 0,
        }
    }

    /// The music player's bundle id, empty if it is not set by bundle id.
    pub fn music_player_bundle_id(&self) -> String {
        match &self.state.lock().music_player {
            MusicPlayer::BundleId(bundle_id) => bundle_id.to_string(),
            _ => String::new(),
        }
    }

    /// Whether a client is the music player. For the IO thread.
    pub fn is_music_player_rt(&self, client_id: ClientId) -> bool {
        self.client_map
            .with_client_rt(client_id, |c| c.is_music_player)
            .unwrap_or(false)
    }

    /// A client's relative volume, unity if it is unknown. For the IO thread.
    pub fn client_relative_volume_rt(&self, client_id: ClientId) -> f32 {
        self.client_map
            .with_client_rt(client_id, |c| c.relative_volume)
            .unwrap_or(DEFAULT_RELATIVE_VOLUME)
    }

    /// A client's pan position, centre if it is unknown. For the IO thread.
    pub fn client_pan_position_rt(&self, client_id: ClientId) -> i32 {
        self.client_map
            .with_client_rt(client_id, |c| c.pan_position)
            .unwrap_or(DEFAULT_PAN_POSITION)
    }

    /// Apply app volume records from the control channel.
    ///
    /// Every record is validated before any is applied; out-of-range values are rejected, not
    /// clamped. A record is applied by process id first and by bundle id if no client of the
    /// process is connected. A bundle id with no connected client has its settings stored so
    /// the app gets them when it connects. Returns whether anything changed.
    pub fn set_clients_relative_volumes(&self, app_volumes: &[AppVolume]) -> Result<bool, VolumeError> {
        for record in app_volumes {
            validate(record)?;
        }

        let mut changed = false;
        for record in app_volumes {
            let volume = record
                .relative_volume
                .map(|raw| self.volume_curve.raw_to_scalar(raw) * MAX_RELATIVE_VOLUME);
            if let Some(volume) = volume {
                changed |= self.apply(record, |map, selector| {
                    map.set_clients_relative_volume(selector, volume)
                });
            }
            if let Some(pan) = record.pan_position {
                changed |= self.apply(record, |map, selector| map.set_clients_pan_position(selector, pan));
            }
            if !self.is_connected(record) {
                if let Some(bundle_id) = record.bundle_id.as_deref() {
                    changed |= self
                        .client_map
                        .remember_past_settings(bundle_id, volume, record.pan_position);
                }
            }
            debug!(
                pid = ?record.process_id,
                bundle_id = record.bundle_id.as_deref().unwrap_or_default(),
                raw_volume = ?record.relative_volume,
                pan = ?record.pan_position,
                "app volume applied"
            );
        }
        Ok(changed)
    }

    fn apply(
        &self,
        record: &AppVolume,
        set: impl Fn(&ClientMap, ClientSelector<'_>) -> bool,
    ) -> bool {
        if let Some(pid) = record.process_id {
            if set(&self.client_map, ClientSelector::ProcessId(pid)) {
                return true;
            }
        }
        match record.bundle_id.as_deref() {
            Some(bundle_id) => set(&self.client_map, ClientSelector::BundleId(bundle_id)),
            None => false,
        }
    }

    fn is_connected(&self, record: &AppVolume) -> bool {
        let by_pid = record
            .process_id
            .is_some_and(|pid| !self.client_map.clients_by_pid(pid).is_empty());
        let by_bundle_id = record
            .bundle_id
            .as_deref()
            .is_some_and(|id| !self.client_map.clients_by_bundle_id(id).is_empty());
        by_pid || by_bundle_id
    }

    /// Current and past clients whose volume or pan differ from the defaults, with the
    /// volume converted back to its raw value.
    pub fn app_volumes(&self) -> Vec<AppVolume> {
        self.client_map
            .clients()
            .iter()
            .chain(self.client_map.past_clients().iter())
            .filter(|client| client.has_custom_volume())
            .map(|client| AppVolume {
                process_id: Some(client.process_id),
                bundle_id: client.bundle_id_str().map(str::to_owned),
                relative_volume: Some(
                    self.volume_curve
                        .scalar_to_raw(client.relative_volume / MAX_RELATIVE_VOLUME),
                ),
                pan_position: Some(client.pan_position),
            })
            .collect()
    }
}

fn validate(record: &AppVolume) -> Result<(), VolumeError> {
    if record.process_id.is_none() && record.bundle_id.as_deref().is_none_or(str::is_empty) {
        return Err(VolumeError::MissingTarget);
    }
    if record.relative_volume.is_none() && record.pan_position.is_none() {
        return Err(VolumeError::MissingValue);
    }
    if let Some(raw) = record.relative_volume {
        if !(MIN_RAW_VOLUME..=MAX_RAW_VOLUME).contains(&raw) {
            return Err(VolumeError::VolumeOutOfRange(raw));
        }
    }
    if let Some(pan) = record.pan_position {
        if !(MIN_PAN..=MAX_PAN).contains(&pan) {
            return Err(VolumeError::PanOutOfRange(pan));
        }
    }
    Ok(())
}
