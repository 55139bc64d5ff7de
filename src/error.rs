//! Error types shared by the client registry, the task queue and the device.

use crate::client::ClientId;

/// Errors raised by the client registry and the IO reference counter.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The client id does not belong to a connected client. Usually a benign race with a
    /// client disconnecting.
    #[error("invalid client id: {0}")]
    InvalidClient(ClientId),
    /// A client with this id is already connected.
    #[error("client id {0} is already registered")]
    DuplicateClient(ClientId),
    /// Process ids must not be negative.
    #[error("invalid process id: {0}")]
    InvalidProcessId(i32),
}

/// Errors raised while validating app volume records from the control channel.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VolumeError {
    /// The record had neither a process id nor a bundle id.
    #[error("app volume record has no process id or bundle id")]
    MissingTarget,
    /// The record had neither a relative volume nor a pan position.
    #[error("app volume record has no relative volume or pan position")]
    MissingValue,
    /// Raw relative volume outside `0..=100`.
    #[error("relative volume {0} out of range")]
    VolumeOutOfRange(i32),
    /// Raw pan position outside `-100..=100`.
    #[error("pan position {0} out of range")]
    PanOutOfRange(i32),
}

/// Errors raised while creating or talking to the worker threads.
#[derive(thiserror::Error, Debug)]
pub enum TaskQueueError {
    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn {name} worker thread: {source}")]
    Spawn {
        /// Worker thread name.
        name: &'static str,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// The real-time worker could not be given its time-constraint policy.
    #[error("failed to set real-time scheduling policy (kern_return {0})")]
    SchedulingPolicy(i32),
    /// A worker thread exited before reporting that it started.
    #[error("{0} worker thread exited during startup")]
    WorkerExited(&'static str),
}

/// Top level error surfaced by [`Device`](crate::device::Device) operations.
#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    /// See [`ClientError`].
    #[error(transparent)]
    Client(#[from] ClientError),
    /// See [`VolumeError`].
    #[error(transparent)]
    Volume(#[from] VolumeError),
    /// See [`TaskQueueError`].
    #[error(transparent)]
    TaskQueue(#[from] TaskQueueError),
    /// The property cannot be written.
    #[error("property {0:?} is read only")]
    ReadOnlyProperty(crate::property::Property),
}
