//! Host clock conversions and real-time thread scheduling.
use std::time::Duration;

use once_cell::sync::Lazy;
use tracing::debug;

use crate::error::TaskQueueError;

#[cfg(target_os = "macos")]
use mach::mach_time::{mach_absolute_time, mach_timebase_info, mach_timebase_info_data_t};

#[cfg(target_os = "macos")]
fn timebase() -> (u64, u64) {
    static TIMEBASE: Lazy<(u64, u64)> = Lazy::new(|| unsafe {
        let mut info = mach_timebase_info_data_t::default();
        mach_timebase_info(&mut info);
        (info.numer as u64, info.denom as u64)
    });
    *TIMEBASE
}

/// Convert a mach host time tick count into nanoseconds.
pub fn host_time_to_ns(host_time: u64) -> u64 {
    #[cfg(target_os = "macos")]
    {
        let (numer, denom) = timebase();
        ((host_time as u128 * numer as u128) / denom as u128) as u64
    }
    #[cfg(not(target_os = "macos"))]
    {
        host_time
    }
}

/// Convert nanoseconds into mach host time ticks.
pub fn ns_to_host_time(ns: u64) -> u64 {
    #[cfg(target_os = "macos")]
    {
        let (numer, denom) = timebase();
        ((ns as u128 * denom as u128) / numer as u128) as u64
    }
    #[cfg(not(target_os = "macos"))]
    {
        ns
    }
}

/// Monotonic clock in nanoseconds.
pub fn monotonic_timestamp_ns() -> u64 {
    #[cfg(target_os = "macos")]
    {
        let host_time = unsafe { mach_absolute_time() };
        host_time_to_ns(host_time)
    }
    #[cfg(not(target_os = "macos"))]
    {
        static START: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);
        START.elapsed().as_nanos() as u64
    }
}

/// Time-constraint parameters for the real-time worker thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeConstraint {
    /// Zero lets the scheduler run the thread aperiodically.
    pub period: Duration,
    /// Nominal amount of computation per wakeup.
    pub computation: Duration,
    /// Maximum computation before the thread is preempted.
    pub constraint: Duration,
    /// Whether the computation may be interrupted.
    pub preemptible: bool,
}

#[cfg(target_os = "macos")]
mod mach_policy {
    use std::ffi::c_void;

    use mach::kern_return::kern_return_t;

    pub const THREAD_TIME_CONSTRAINT_POLICY: u32 = 2;
    pub const THREAD_TIME_CONSTRAINT_POLICY_COUNT: u32 = 4;

    #[repr(C)]
    pub struct ThreadTimeConstraintPolicy {
        pub period: u32,
        pub computation: u32,
        pub constraint: u32,
        pub preemptible: u32,
    }

    unsafe extern "C" {
        pub fn pthread_self() -> *mut c_void;
        pub fn pthread_mach_thread_np(thread: *mut c_void) -> u32;
        pub fn thread_policy_set(
            thread: u32,
            flavor: u32,
            policy_info: *mut i32,
            count: u32,
        ) -> kern_return_t;
    }
}

/// Give the calling thread a time-constraint scheduling policy.
///
/// Only macOS has such a policy; elsewhere the thread keeps its default priority.
pub fn promote_current_thread(constraint: &TimeConstraint) -> Result<(), TaskQueueError> {
    #[cfg(target_os = "macos")]
    {
        use mach::kern_return::KERN_SUCCESS;
        use mach_policy::*;

        let ticks = |d: Duration| ns_to_host_time(d.as_nanos() as u64).min(u32::MAX as u64) as u32;
        let mut policy = ThreadTimeConstraintPolicy {
            period: ticks(constraint.period),
            computation: ticks(constraint.computation),
            constraint: ticks(constraint.constraint),
            preemptible: constraint.preemptible as u32,
        };
        let result = unsafe {
            thread_policy_set(
                pthread_mach_thread_np(pthread_self()),
                THREAD_TIME_CONSTRAINT_POLICY,
                &mut policy as *mut ThreadTimeConstraintPolicy as *mut i32,
                THREAD_TIME_CONSTRAINT_POLICY_COUNT,
            )
        };
        if result != KERN_SUCCESS {
            return Err(TaskQueueError::SchedulingPolicy(result));
        }
        debug!(?constraint, "real-time scheduling policy set");
        Ok(())
    }
    #[cfg(not(target_os = "macos"))]
    {
        debug!(?constraint, "no time-constraint policy on this platform");
        Ok(())
    }
}
