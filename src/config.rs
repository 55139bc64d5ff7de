//! Tunables for the device and its worker threads.
use std::time::Duration;

use crate::audible_state::DEFAULT_HYSTERESIS_FRAMES;
use crate::clock::TimeConstraint;
use crate::property::ObjectId;

/// Bundle id of the companion app.
pub const APP_BUNDLE_ID: &str = "com.bearisdriving.BGM.App";

/// Worker thread settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskQueueConfig {
    /// Async task nodes allocated up front.
    pub free_list_capacity: usize,
    /// Nominal computation per wakeup of the real-time worker.
    pub realtime_computation: Duration,
    /// Computation after which the real-time worker may be preempted.
    pub realtime_constraint: Duration,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            free_list_capacity: 512,
            realtime_computation: Duration::from_micros(50),
            realtime_constraint: Duration::from_micros(60),
        }
    }
}

impl TaskQueueConfig {
    /// Scheduling policy requested for the real-time worker.
    pub fn time_constraint(&self) -> TimeConstraint {
        TimeConstraint {
            period: Duration::ZERO,
            computation: self.realtime_computation,
            constraint: self.realtime_constraint,
            preemptible: true,
        }
    }

    /// How long a synchronous caller sleeps before rechecking its task.
    pub fn sync_wait_timeout(&self) -> Duration {
        self.realtime_constraint * 4
    }
}

/// Device settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Object id passed to property notifications.
    pub device_id: ObjectId,
    /// Bundle id of the companion app, excluded from the "running elsewhere" count.
    pub app_bundle_id: String,
    /// Frames a new audible state must hold before it is published.
    pub audible_hysteresis_frames: u32,
    /// Worker thread settings.
    pub task_queue: TaskQueueConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: 2,
            app_bundle_id: APP_BUNDLE_ID.to_owned(),
            audible_hysteresis_frames: DEFAULT_HYSTERESIS_FRAMES,
            task_queue: TaskQueueConfig::default(),
        }
    }
}
