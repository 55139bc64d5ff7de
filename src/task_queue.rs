//! Two worker threads that run work on behalf of the IO and control threads.
//!
//! The real-time worker runs with a time-constraint policy and only performs short,
//! allocation free steps such as swapping the client maps. The non-real-time worker runs
//! everything else: starting and stopping client IO, sending property notifications.
//!
//! Each worker owns a lock-free stack of pending tasks and two semaphores. Producers push a
//! task and signal `work_queued`. The worker drains the whole stack at once, reverses it into
//! submission order and runs every task. Synchronous tasks live on the caller's stack; the
//! worker marks them complete and broadcasts `sync_task_completed`, after which it never
//! touches them again. Asynchronous tasks come from a pre-allocated free list and go back to
//! it when they are done, so queueing one from the IO thread does not allocate.
//!
//! A worker stops at its stop task. Stopping closes its stack; whatever is still queued is
//! released, and synchronous callers still waiting on it panic.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::atomic_stack::{AtomicStack, Linked};
use crate::client::ClientId;
use crate::client_map::ShadowSwap;
use crate::clients::Clients;
use crate::clock::{monotonic_timestamp_ns, promote_current_thread};
use crate::config::TaskQueueConfig;
use crate::error::{ClientError, TaskQueueError};
use crate::property::{HostNotifier, ObjectId, Property};
use crate::semaphore::Semaphore;

/// Value a sync task reports when its handler has nothing to return.
const NO_RETURN_VALUE: u64 = i64::MAX as u64;

/// Work a task asks a worker to do.
pub(crate) enum Task {
    /// Placeholder left in a node whose task has been taken.
    Uninitialized,
    /// Ends the worker loop. Tasks queued behind it are not run.
    StopWorkerThread,
    /// Swap the shadow client maps into the live ones. Real-time worker only.
    SwapClientShadowMaps(ShadowSwap),
    /// Count a client as doing IO.
    StartClientIo {
        clients: Arc<Clients>,
        client_id: ClientId,
    },
    /// Count a client as no longer doing IO.
    StopClientIo {
        clients: Arc<Clients>,
        client_id: ClientId,
    },
    /// Tell the host a device property changed. Non-real-time worker only.
    SendPropertyNotification {
        device: ObjectId,
        property: Property,
    },
    /// Return the token unchanged. Measures worker round trips.
    Ping(u64),
}

impl Task {
    fn name(&self) -> &'static str {
        match self {
            Task::Uninitialized => "uninitialized",
            Task::StopWorkerThread => "stop_worker_thread",
            Task::SwapClientShadowMaps(_) => "swap_client_shadow_maps",
            Task::StartClientIo { .. } => "start_client_io",
            Task::StopClientIo { .. } => "stop_client_io",
            Task::SendPropertyNotification { .. } => "send_property_notification",
            Task::Ping(_) => "ping",
        }
    }
}

pub(crate) struct TaskNode {
    next: *mut TaskNode,
    task: Task,
    is_sync: bool,
    complete: AtomicBool,
    abandoned: AtomicBool,
    return_value: AtomicU64,
}

// Nodes move between threads through the stacks and the free list. The raw pointers they
// carry are only dereferenced by the worker that owns the node at that moment.
unsafe impl Send for TaskNode {}

impl TaskNode {
    fn new(task: Task, is_sync: bool) -> Self {
        Self {
            next: ptr::null_mut(),
            task,
            is_sync,
            complete: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
            return_value: AtomicU64::new(NO_RETURN_VALUE),
        }
    }
}

impl Linked for TaskNode {
    unsafe fn next(node: *mut Self) -> *mut Self {
        unsafe { ptr::addr_of!((*node).next).read() }
    }

    unsafe fn set_next(node: *mut Self, next: *mut Self) {
        unsafe { ptr::addr_of_mut!((*node).next).write(next) }
    }
}

struct Worker {
    name: &'static str,
    tasks: AtomicStack<TaskNode>,
    work_queued: Semaphore,
    sync_task_completed: Semaphore,
    closed: AtomicBool,
    producers: AtomicUsize,
    panicked: AtomicBool,
}

impl Worker {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            tasks: AtomicStack::new(),
            work_queued: Semaphore::new(),
            sync_task_completed: Semaphore::new(),
            closed: AtomicBool::new(false),
            producers: AtomicUsize::new(0),
            panicked: AtomicBool::new(false),
        }
    }

    /// Push `node` and wake the worker, unless the worker has been closed. Returns whether the
    /// node was pushed; if not, the caller still owns it.
    ///
    /// # Safety
    ///
    /// See [`AtomicStack::push`].
    unsafe fn push(&self, node: *mut TaskNode) -> bool {
        self.producers.fetch_add(1, Ordering::SeqCst);
        let open = !self.closed.load(Ordering::SeqCst);
        if open {
            unsafe { self.tasks.push(node) };
            self.work_queued.signal();
        }
        self.producers.fetch_sub(1, Ordering::SeqCst);
        open
    }

    /// Refuse further pushes and wait out the ones in progress. Afterwards the stack only
    /// shrinks.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        while self.producers.load(Ordering::SeqCst) != 0 {
            thread::yield_now();
        }
    }
}

/// Records a panicking worker and wakes its sync callers so they notice.
struct PanicGuard<'a>(&'a Worker);

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.panicked.store(true, Ordering::Release);
            error!(worker = self.0.name, "worker thread panicked");
            self.0.sync_task_completed.signal_all();
        }
    }
}

struct Shared {
    realtime: Worker,
    non_realtime: Worker,
    free_tx: Sender<Box<TaskNode>>,
    free_rx: Receiver<Box<TaskNode>>,
    notifier: Arc<dyn HostNotifier>,
    config: TaskQueueConfig,
}

impl Shared {
    fn worker(&self, realtime: bool) -> &Worker {
        if realtime {
            &self.realtime
        } else {
            &self.non_realtime
        }
    }

    /// Run one task. Returns the task's return value and whether the worker should stop.
    fn process(&self, task: Task, realtime: bool) -> (u64, bool) {
        match task {
            Task::Uninitialized => panic!("worker received an uninitialized task"),
            Task::StopWorkerThread => (NO_RETURN_VALUE, true),
            Task::SwapClientShadowMaps(swap) => {
                assert!(realtime, "client maps must be swapped on the real-time worker");
                // SAFETY: the requesting thread holds the shadow lock and is blocked until
                // this task completes.
                unsafe { swap.perform() };
                (NO_RETURN_VALUE, false)
            }
            Task::StartClientIo { clients, client_id } => {
                (io_result(clients.start_io_non_rt(client_id), "start", client_id), false)
            }
            Task::StopClientIo { clients, client_id } => {
                (io_result(clients.stop_io_non_rt(client_id), "stop", client_id), false)
            }
            Task::SendPropertyNotification { device, property } => {
                assert!(!realtime, "notifications are sent from the non-real-time worker");
                debug!(device, %property, "property changed");
                self.notifier.properties_changed(device, &[property]);
                (NO_RETURN_VALUE, false)
            }
            Task::Ping(token) => (token, false),
        }
    }

    fn worker_loop(&self, realtime: bool) {
        let worker = self.worker(realtime);
        let _guard = PanicGuard(worker);
        loop {
            worker.work_queued.wait();
            let mut stop = false;
            let mut batch = worker.tasks.pop_all_reversed();
            for node in batch.by_ref() {
                // SAFETY: the node stays valid until it is marked complete (sync) or handed
                // back to the free list (async). Only the `task` and `complete` fields are
                // touched while the submitter may be reading `complete`.
                unsafe {
                    assert!(
                        !(*node).complete.load(Ordering::Acquire),
                        "task was processed twice"
                    );
                    let task = ptr::replace(ptr::addr_of_mut!((*node).task), Task::Uninitialized);
                    let is_sync = ptr::addr_of!((*node).is_sync).read();
                    let (result, stop_requested) = self.process(task, realtime);
                    if is_sync {
                        (*node).return_value.store(result, Ordering::Relaxed);
                        (*node).complete.store(true, Ordering::Release);
                        worker.sync_task_completed.signal_all();
                    } else {
                        self.recycle(Box::from_raw(node));
                    }
                    if stop_requested {
                        stop = true;
                        break;
                    }
                }
            }
            if stop {
                // The rest of the batch goes back on the stack for `stop_worker` to release.
                for node in batch {
                    // SAFETY: the drain read each link before yielding the node.
                    unsafe { worker.tasks.push(node) };
                }
                debug!(worker = worker.name, "worker thread stopping");
                break;
            }
        }
    }

    fn recycle(&self, mut node: Box<TaskNode>) {
        node.next = ptr::null_mut();
        node.task = Task::Uninitialized;
        node.complete.store(false, Ordering::Relaxed);
        node.abandoned.store(false, Ordering::Relaxed);
        node.return_value.store(NO_RETURN_VALUE, Ordering::Relaxed);
        // Nodes allocated after the free list ran dry are freed instead.
        let _ = self.free_tx.try_send(node);
    }
}

fn io_result(result: Result<bool, ClientError>, action: &'static str, client_id: ClientId) -> u64 {
    match result {
        Ok(changed) => changed as u64,
        Err(err @ ClientError::InvalidClient(_)) => {
            debug!(client_id, action, %err, "ignoring IO change for disconnected client");
            0
        }
        Err(err) => {
            error!(client_id, action, %err, "unexpected error changing client IO");
            0
        }
    }
}

#[derive(Default)]
struct WorkerThreads {
    realtime: Option<JoinHandle<()>>,
    non_realtime: Option<JoinHandle<()>>,
}

/// The pair of worker threads and the queues that feed them.
pub struct TaskQueue {
    shared: Arc<Shared>,
    threads: Mutex<WorkerThreads>,
    realtime_thread_id: Option<ThreadId>,
    non_realtime_thread_id: Option<ThreadId>,
}

impl TaskQueue {
    /// Start both worker threads. Fails if a thread cannot be spawned or the real-time worker
    /// cannot get its scheduling policy.
    pub fn new(
        config: TaskQueueConfig,
        notifier: Arc<dyn HostNotifier>,
    ) -> Result<Self, TaskQueueError> {
        let (free_tx, free_rx) = bounded(config.free_list_capacity);
        for _ in 0..config.free_list_capacity {
            let _ = free_tx.try_send(Box::new(TaskNode::new(Task::Uninitialized, false)));
        }
        let shared = Arc::new(Shared {
            realtime: Worker::new("realtime"),
            non_realtime: Worker::new("non_realtime"),
            free_tx,
            free_rx,
            notifier,
            config,
        });
        let mut queue = Self {
            shared,
            threads: Mutex::new(WorkerThreads::default()),
            realtime_thread_id: None,
            non_realtime_thread_id: None,
        };

        let realtime = spawn_worker(&queue.shared, true)?;
        queue.realtime_thread_id = Some(realtime.thread().id());
        queue.threads.get_mut().realtime = Some(realtime);

        // On failure dropping `queue` stops the real-time worker again.
        let non_realtime = spawn_worker(&queue.shared, false)?;
        queue.non_realtime_thread_id = Some(non_realtime.thread().id());
        queue.threads.get_mut().non_realtime = Some(non_realtime);

        debug!(
            free_list = queue.shared.config.free_list_capacity,
            "task queue started"
        );
        Ok(queue)
    }

    /// Run `task` on one of the workers and block until it has completed. Returns the task's
    /// return value.
    ///
    /// Panics if the worker thread has died, since the task can then never complete.
    pub(crate) fn queue_sync(&self, task: Task, realtime: bool) -> u64 {
        let worker = self.shared.worker(realtime);
        let target = if realtime {
            self.realtime_thread_id
        } else {
            self.non_realtime_thread_id
        };
        assert!(
            target != Some(thread::current().id()),
            "a worker cannot wait on its own queue"
        );

        let name = task.name();
        let started = monotonic_timestamp_ns();
        let mut node = TaskNode::new(task, true);
        let node: *mut TaskNode = &mut node;
        // SAFETY: `node` outlives this call and this call does not return until the worker
        // or `stop_worker` has marked it complete.
        if !unsafe { worker.push(node) } {
            panic!("{} worker thread is gone, task {name} cannot complete", worker.name);
        }

        let timeout = self.shared.config.sync_wait_timeout();
        let mut reported_late = false;
        loop {
            // SAFETY: only the `complete` field is read while the worker may hold the node.
            if unsafe { (*node).complete.load(Ordering::Acquire) } {
                break;
            }
            if worker.panicked.load(Ordering::Acquire) {
                panic!("{} worker thread panicked, task {name} cannot complete", worker.name);
            }
            if !worker.sync_task_completed.wait_timeout(timeout) && realtime && !reported_late {
                let elapsed = monotonic_timestamp_ns().saturating_sub(started);
                if elapsed > self.shared.config.realtime_constraint.as_nanos() as u64 {
                    warn!(task = name, elapsed_ns = elapsed, "real-time task running late");
                    reported_late = true;
                }
            }
        }
        // SAFETY: complete, so the worker no longer touches the node.
        unsafe {
            if (*node).abandoned.load(Ordering::Relaxed) {
                panic!("{} worker thread is gone, task {name} cannot complete", worker.name);
            }
            (*node).return_value.load(Ordering::Relaxed)
        }
    }

    /// Queue `task` on the non-real-time worker and return immediately. Safe to call from the
    /// IO thread unless the free list is exhausted, in which case a node is allocated.
    pub(crate) fn queue_async(&self, task: Task) {
        let worker = &self.shared.non_realtime;
        let name = task.name();
        if worker.closed.load(Ordering::Acquire) {
            warn!(task = name, "dropping task queued after shutdown");
            return;
        }
        let node = match self.shared.free_rx.try_recv() {
            Ok(mut node) => {
                node.task = task;
                node
            }
            Err(_) => {
                warn!(task = name, "task free list exhausted, allocating");
                Box::new(TaskNode::new(task, false))
            }
        };
        let node = Box::into_raw(node);
        // SAFETY: once pushed, ownership of the node passes to the worker, which recycles it.
        if !unsafe { worker.push(node) } {
            warn!(task = name, "dropping task queued after shutdown");
            // SAFETY: the node was not pushed, so it is still ours.
            self.shared.recycle(unsafe { Box::from_raw(node) });
        }
    }

    /// Push `tasks` as async tasks and wake the worker once, so it drains them together.
    #[cfg(test)]
    pub(crate) fn queue_async_batch(&self, tasks: impl IntoIterator<Item = Task>) {
        let worker = &self.shared.non_realtime;
        for task in tasks {
            let node = Box::into_raw(Box::new(TaskNode::new(task, false)));
            // SAFETY: the worker takes ownership, as in `queue_async`.
            unsafe { worker.tasks.push(node) };
        }
        worker.work_queued.signal();
    }

    /// Swap shadow and live client maps on the real-time worker.
    pub(crate) fn queue_sync_swap_client_shadow_maps(&self, swap: ShadowSwap) {
        self.queue_sync(Task::SwapClientShadowMaps(swap), true);
    }

    /// Count a client as doing IO. Returns `true` if the device should start IO.
    pub fn queue_sync_start_client_io(&self, clients: &Arc<Clients>, client_id: ClientId) -> bool {
        let task = Task::StartClientIo {
            clients: Arc::clone(clients),
            client_id,
        };
        self.queue_sync(task, false) == 1
    }

    /// Count a client as no longer doing IO. Returns `true` if the device should stop IO.
    pub fn queue_sync_stop_client_io(&self, clients: &Arc<Clients>, client_id: ClientId) -> bool {
        let task = Task::StopClientIo {
            clients: Arc::clone(clients),
            client_id,
        };
        self.queue_sync(task, false) == 1
    }

    /// Asynchronous [`queue_sync_start_client_io`](Self::queue_sync_start_client_io).
    pub fn queue_async_start_client_io(&self, clients: &Arc<Clients>, client_id: ClientId) {
        self.queue_async(Task::StartClientIo {
            clients: Arc::clone(clients),
            client_id,
        });
    }

    /// Asynchronous [`queue_sync_stop_client_io`](Self::queue_sync_stop_client_io).
    pub fn queue_async_stop_client_io(&self, clients: &Arc<Clients>, client_id: ClientId) {
        self.queue_async(Task::StopClientIo {
            clients: Arc::clone(clients),
            client_id,
        });
    }

    /// Notify the host from the non-real-time worker.
    pub fn queue_async_send_property_notification(&self, property: Property, device: ObjectId) {
        self.queue_async(Task::SendPropertyNotification { device, property });
    }

    /// Round trip `token` through a worker and return what came back.
    pub fn ping(&self, realtime: bool, token: u64) -> u64 {
        self.queue_sync(Task::Ping(token), realtime)
    }

    /// Number of unused nodes on the async free list.
    pub fn free_tasks(&self) -> usize {
        self.shared.free_rx.len()
    }

    /// Stop both workers after they finish what is already queued. Tasks queued afterwards
    /// are dropped. Called automatically on drop.
    pub fn shutdown(&self) {
        // Non-real-time tasks may still need the real-time worker to swap client maps.
        self.stop_worker(false);
        self.stop_worker(true);
    }

    fn stop_worker(&self, realtime: bool) {
        let handle = {
            let mut threads = self.threads.lock();
            if realtime {
                threads.realtime.take()
            } else {
                threads.non_realtime.take()
            }
        };
        let Some(handle) = handle else {
            return;
        };
        assert!(
            handle.thread().id() != thread::current().id(),
            "a worker cannot stop itself"
        );
        let worker = self.shared.worker(realtime);
        let stop = Box::into_raw(Box::new(TaskNode::new(Task::StopWorkerThread, false)));
        // SAFETY: as in `queue_async`. If the worker already stopped, the node is released
        // with the other leftovers below.
        if !unsafe { worker.push(stop) } {
            // SAFETY: not pushed, still ours.
            drop(unsafe { Box::from_raw(stop) });
        }
        if handle.join().is_err() {
            error!(worker = worker.name, "worker thread exited with a panic");
        }
        debug!(worker = worker.name, "worker thread joined");

        worker.close();
        if worker.panicked.load(Ordering::Acquire) {
            // Leftover sync nodes may belong to callers that unwound; leave them alone.
            return;
        }
        for node in worker.tasks.pop_all_reversed() {
            // SAFETY: the worker has exited and the stack is closed, so nothing else holds
            // these nodes.
            unsafe {
                if ptr::addr_of!((*node).is_sync).read() {
                    (*node).abandoned.store(true, Ordering::Relaxed);
                    (*node).complete.store(true, Ordering::Release);
                } else {
                    drop(Box::from_raw(node));
                }
            }
        }
        worker.sync_task_completed.signal_all();
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(shared: &Arc<Shared>, realtime: bool) -> Result<JoinHandle<()>, TaskQueueError> {
    let shared = Arc::clone(shared);
    let name = shared.worker(realtime).name;
    let (ready_tx, ready_rx) = bounded::<Result<(), TaskQueueError>>(1);
    let handle = thread::Builder::new()
        .name(format!("volume_kit.{name}"))
        .spawn(move || {
            if realtime {
                if let Err(err) = promote_current_thread(&shared.config.time_constraint()) {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            }
            let _ = ready_tx.send(Ok(()));
            shared.worker_loop(realtime);
        })
        .map_err(|source| TaskQueueError::Spawn { name, source })?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(err)) => {
            let _ = handle.join();
            Err(err)
        }
        Err(_) => {
            let _ = handle.join();
            Err(TaskQueueError::WorkerExited(name))
        }
    }
}
