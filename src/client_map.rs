//! Client registry with a live copy for the IO thread and a shadow copy for everyone else.
//!
//! Every mutation takes the shadow lock, applies the change to the shadow maps, has the
//! real-time worker swap shadow and live, then applies the same change again to the new
//! shadow. The IO thread therefore only ever sees a fully updated copy and both copies are
//! equal whenever the shadow lock is free.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::client::{BundleId, Client, ClientId, ProcessId};
use crate::error::ClientError;
use crate::task_queue::TaskQueue;

/// The three client indices.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientMaps {
    by_id: HashMap<ClientId, Client>,
    by_pid: HashMap<ProcessId, Vec<ClientId>>,
    by_bundle_id: HashMap<BundleId, Vec<ClientId>>,
}

impl ClientMaps {
    /// Client with the given id.
    pub fn get(&self, client_id: ClientId) -> Option<&Client> {
        self.by_id.get(&client_id)
    }

    /// Number of connected clients.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether no client is connected.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Clients belonging to a process, in connection order.
    pub fn by_pid(&self, pid: ProcessId) -> impl Iterator<Item = &Client> {
        self.lookup(self.by_pid.get(&pid))
    }

    /// Clients with a bundle id, in connection order.
    pub fn by_bundle_id(&self, bundle_id: &str) -> impl Iterator<Item = &Client> {
        self.lookup(self.by_bundle_id.get(bundle_id))
    }

    /// Every client, ordered by client id.
    pub fn clients(&self) -> Vec<&Client> {
        let mut clients: Vec<&Client> = self.by_id.values().collect();
        clients.sort_by_key(|c| c.client_id);
        clients
    }

    fn lookup<'a>(&'a self, ids: Option<&'a Vec<ClientId>>) -> impl Iterator<Item = &'a Client> {
        ids.into_iter()
            .flatten()
            .filter_map(move |id| self.by_id.get(id))
    }

    fn insert(&mut self, client: Client) {
        self.by_pid
            .entry(client.process_id)
            .or_default()
            .push(client.client_id);
        if let Some(bundle_id) = &client.bundle_id {
            self.by_bundle_id
                .entry(bundle_id.clone())
                .or_default()
                .push(client.client_id);
        }
        self.by_id.insert(client.client_id, client);
    }

    fn remove(&mut self, client_id: ClientId) -> Option<Client> {
        let client = self.by_id.remove(&client_id)?;
        remove_from_index(&mut self.by_pid, &client.process_id, client_id);
        if let Some(bundle_id) = &client.bundle_id {
            remove_from_index(&mut self.by_bundle_id, bundle_id, client_id);
        }
        Some(client)
    }

    fn update_where(&mut self, ids: Vec<ClientId>, mut update: impl FnMut(&mut Client)) -> bool {
        let mut found = false;
        for id in ids {
            if let Some(client) = self.by_id.get_mut(&id) {
                update(client);
                found = true;
            }
        }
        found
    }

    fn ids_by_pid(&self, pid: ProcessId) -> Vec<ClientId> {
        self.by_pid.get(&pid).cloned().unwrap_or_default()
    }

    fn ids_by_bundle_id(&self, bundle_id: &str) -> Vec<ClientId> {
        self.by_bundle_id.get(bundle_id).cloned().unwrap_or_default()
    }
}

fn remove_from_index<K, Q>(index: &mut HashMap<K, Vec<ClientId>>, key: &Q, client_id: ClientId)
where
    K: std::borrow::Borrow<Q> + std::hash::Hash + Eq,
    Q: std::hash::Hash + Eq + ?Sized,
{
    if let Some(ids) = index.get_mut(key) {
        ids.retain(|id| *id != client_id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

/// Identifies the music player.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum MusicPlayer {
    /// No music player is set.
    #[default]
    Unset,
    /// Every client of this process is the music player.
    ProcessId(ProcessId),
    /// Every client with this bundle id is the music player.
    BundleId(BundleId),
}

impl MusicPlayer {
    /// Whether `client` is (part of) the music player.
    pub fn matches(&self, client: &Client) -> bool {
        match self {
            MusicPlayer::Unset => false,
            MusicPlayer::ProcessId(pid) => client.process_id == *pid,
            MusicPlayer::BundleId(bundle_id) => client.bundle_id.as_ref() == Some(bundle_id),
        }
    }
}

/// Addresses the clients an update applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientSelector<'a> {
    /// Every client of a process.
    ProcessId(ProcessId),
    /// Every client with a bundle id.
    BundleId(&'a str),
}

struct ShadowState {
    maps: ClientMaps,
    past_clients: HashMap<BundleId, Client>,
}

/// Lets the real-time worker swap a shadow copy, borrowed from a thread blocked on the swap,
/// into the live slot.
pub(crate) struct ShadowSwap {
    live: *const Mutex<ClientMaps>,
    shadow: *mut ClientMaps,
}

// Only handed to the real-time worker while the owning thread waits for it.
unsafe impl Send for ShadowSwap {}

impl ShadowSwap {
    /// # Safety
    ///
    /// Both pointers must still be valid and nothing else may access the shadow copy until
    /// this returns.
    pub(crate) unsafe fn perform(self) {
        let (live, shadow) = unsafe { (&*self.live, &mut *self.shadow) };
        mem::swap(&mut *live.lock(), shadow);
    }
}

/// Registry of connected clients. See the module docs for the update protocol.
pub struct ClientMap {
    task_queue: Arc<TaskQueue>,
    live: Mutex<ClientMaps>,
    shadow: Mutex<ShadowState>,
}

impl ClientMap {
    /// Empty registry whose swaps run on `task_queue`'s real-time worker.
    pub fn new(task_queue: Arc<TaskQueue>) -> Self {
        Self {
            task_queue,
            live: Mutex::new(ClientMaps::default()),
            shadow: Mutex::new(ShadowState {
                maps: ClientMaps::default(),
                past_clients: HashMap::new(),
            }),
        }
    }

    /// Apply `mutation` to the shadow maps, swap them live, and apply it to the new shadow.
    /// Returns the result of the first application.
    fn apply_and_swap<R>(
        &self,
        maps: &mut ClientMaps,
        mut mutation: impl FnMut(&mut ClientMaps) -> R,
    ) -> R {
        let result = mutation(maps);
        self.swap_in_shadow_maps(maps);
        mutation(maps);
        result
    }

    fn swap_in_shadow_maps(&self, shadow: &mut ClientMaps) {
        self.task_queue
            .queue_sync_swap_client_shadow_maps(ShadowSwap {
                live: &self.live,
                shadow,
            });
    }

    /// Register a client. A client whose bundle id was seen before gets its previous volume
    /// and pan back.
    pub fn add_client(&self, mut client: Client) -> Result<(), ClientError> {
        let mut shadow = self.shadow.lock();
        if shadow.maps.by_id.contains_key(&client.client_id) {
            return Err(ClientError::DuplicateClient(client.client_id));
        }
        if let Some(past) = client
            .bundle_id
            .as_ref()
            .and_then(|bundle_id| shadow.past_clients.remove(bundle_id))
        {
            debug!(
                client_id = client.client_id,
                bundle_id = %past.bundle_id_str().unwrap_or_default(),
                volume = past.relative_volume,
                pan = past.pan_position,
                "restoring past client volume"
            );
            client.relative_volume = past.relative_volume;
            client.pan_position = past.pan_position;
        }
        let ShadowState { maps, .. } = &mut *shadow;
        self.apply_and_swap(maps, |maps| maps.insert(client.clone()));
        Ok(())
    }

    /// Unregister a client and remember its settings under its bundle id.
    pub fn remove_client(&self, client_id: ClientId) -> Result<Client, ClientError> {
        let mut shadow = self.shadow.lock();
        if !shadow.maps.by_id.contains_key(&client_id) {
            return Err(ClientError::InvalidClient(client_id));
        }
        let ShadowState { maps, past_clients } = &mut *shadow;
        let removed = self
            .apply_and_swap(maps, |maps| maps.remove(client_id))
            .ok_or(ClientError::InvalidClient(client_id))?;
        if let Some(bundle_id) = &removed.bundle_id {
            past_clients.insert(bundle_id.clone(), removed.clone());
        }
        Ok(removed)
    }

    /// Store volume and pan for an app that is not connected, so it gets them when it
    /// connects. Returns `true` if anything was stored.
    pub fn remember_past_settings(
        &self,
        bundle_id: &str,
        relative_volume: Option<f32>,
        pan_position: Option<i32>,
    ) -> bool {
        let Some(bundle_id) = BundleId::new(bundle_id) else {
            return false;
        };
        if relative_volume.is_none() && pan_position.is_none() {
            return false;
        }
        let mut shadow = self.shadow.lock();
        let past = shadow
            .past_clients
            .entry(bundle_id.clone())
            .or_insert_with(|| Client::new(0, -1, Some(bundle_id.as_str()), true));
        if let Some(volume) = relative_volume {
            past.relative_volume = volume;
        }
        if let Some(pan) = pan_position {
            past.pan_position = pan;
        }
        debug!(bundle_id = %bundle_id, "stored settings for disconnected app");
        true
    }

    /// Copy of a client from the live maps. Does not allocate; for the IO thread.
    pub fn get_client_rt(&self, client_id: ClientId) -> Option<Client> {
        self.live.lock().get(client_id).cloned()
    }

    /// Copy of a client from the shadow maps.
    pub fn get_client_non_rt(&self, client_id: ClientId) -> Option<Client> {
        self.shadow.lock().maps.get(client_id).cloned()
    }

    /// Read a live client in place. Does not allocate; for the IO thread.
    pub fn with_client_rt<R>(&self, client_id: ClientId, read: impl FnOnce(&Client) -> R) -> Option<R> {
        self.live.lock().get(client_id).map(read)
    }

    /// Clients of a process.
    pub fn clients_by_pid(&self, pid: ProcessId) -> Vec<Client> {
        self.shadow.lock().maps.by_pid(pid).cloned().collect()
    }

    /// Clients with a bundle id.
    pub fn clients_by_bundle_id(&self, bundle_id: &str) -> Vec<Client> {
        self.shadow.lock().maps.by_bundle_id(bundle_id).cloned().collect()
    }

    /// Every connected client, ordered by id.
    pub fn clients(&self) -> Vec<Client> {
        self.shadow.lock().maps.clients().into_iter().cloned().collect()
    }

    /// Clients that disconnected, keyed by bundle id, ordered by bundle id.
    pub fn past_clients(&self) -> Vec<Client> {
        let shadow = self.shadow.lock();
        let mut past: Vec<Client> = shadow.past_clients.values().cloned().collect();
        past.sort_by(|a, b| a.bundle_id.cmp(&b.bundle_id));
        past
    }

    /// Clone of the live maps, for diagnostics. Allocates.
    pub fn live_snapshot(&self) -> ClientMaps {
        self.live.lock().clone()
    }

    /// Clone of the shadow maps, for diagnostics.
    pub fn shadow_snapshot(&self) -> ClientMaps {
        self.shadow.lock().maps.clone()
    }

    /// Mark a client as doing IO or not.
    pub fn set_doing_io(&self, client_id: ClientId, doing_io: bool) -> Result<(), ClientError> {
        let mut shadow = self.shadow.lock();
        if !shadow.maps.by_id.contains_key(&client_id) {
            return Err(ClientError::InvalidClient(client_id));
        }
        self.apply_and_swap(&mut shadow.maps, |maps| {
            if let Some(client) = maps.by_id.get_mut(&client_id) {
                client.doing_io = doing_io;
            }
        });
        Ok(())
    }

    /// Recompute every client's music player flag.
    pub fn update_music_player_flags(&self, music_player: &MusicPlayer) {
        let mut shadow = self.shadow.lock();
        self.apply_and_swap(&mut shadow.maps, |maps| {
            for client in maps.by_id.values_mut() {
                client.is_music_player = music_player.matches(client);
            }
        });
    }

    /// Set the relative volume of the selected clients. Returns `true` if any client matched.
    pub fn set_clients_relative_volume(&self, selector: ClientSelector<'_>, volume: f32) -> bool {
        self.update_selected(selector, |client| client.relative_volume = volume)
    }

    /// Set the pan position of the selected clients. Returns `true` if any client matched.
    pub fn set_clients_pan_position(&self, selector: ClientSelector<'_>, pan: i32) -> bool {
        self.update_selected(selector, |client| client.pan_position = pan)
    }

    fn update_selected(&self, selector: ClientSelector<'_>, update: impl Fn(&mut Client)) -> bool {
        let mut shadow = self.shadow.lock();
        let ids = match selector {
            ClientSelector::ProcessId(pid) => shadow.maps.ids_by_pid(pid),
            ClientSelector::BundleId(bundle_id) => shadow.maps.ids_by_bundle_id(bundle_id),
        };
        if ids.is_empty() {
            return false;
        }
        self.apply_and_swap(&mut shadow.maps, |maps| maps.update_where(ids.clone(), &update))
    }
}
