use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::clients::Clients;
use crate::config::{APP_BUNDLE_ID, TaskQueueConfig};
use crate::property::{ChannelNotifier, NullNotifier, Property};
use crate::task_queue::{Task, TaskQueue};

fn queue_with_capacity(free_list_capacity: usize) -> TaskQueue {
    let config = TaskQueueConfig {
        free_list_capacity,
        ..TaskQueueConfig::default()
    };
    TaskQueue::new(config, Arc::new(NullNotifier)).unwrap()
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

#[test]
fn sync_tasks_return_their_own_value() {
    let queue = queue_with_capacity(8);
    assert_eq!(queue.queue_sync(Task::Ping(41), true), 41);
    assert_eq!(queue.queue_sync(Task::Ping(42), false), 42);
}

#[test]
fn async_nodes_return_to_the_free_list() {
    let queue = queue_with_capacity(16);
    assert_eq!(queue.free_tasks(), 16);
    for _ in 0..10 {
        queue.queue_async(Task::Ping(1));
    }
    assert!(wait_for(|| queue.free_tasks() == 16));
}

#[test]
fn exhausted_free_list_allocates_instead_of_dropping() {
    let (notifier, notifications) = ChannelNotifier::new();
    let config = TaskQueueConfig {
        free_list_capacity: 2,
        ..TaskQueueConfig::default()
    };
    let queue = TaskQueue::new(config, Arc::new(notifier)).unwrap();
    for _ in 0..20 {
        queue.queue_async_send_property_notification(Property::AppVolumes, 9);
    }
    for _ in 0..20 {
        let received = notifications.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(received, (9, Property::AppVolumes));
    }
    assert!(wait_for(|| queue.free_tasks() == 2));
}

#[test]
fn async_tasks_run_in_submission_order() {
    let (notifier, notifications) = ChannelNotifier::new();
    let queue = TaskQueue::new(TaskQueueConfig::default(), Arc::new(notifier)).unwrap();
    let order = [
        Property::IsRunning,
        Property::AudibleState,
        Property::AppVolumes,
        Property::RunningSomewhereOtherThanApp,
        Property::MusicPlayerBundleId,
    ];
    for property in order {
        queue.queue_async_send_property_notification(property, 2);
    }
    let received: Vec<Property> = (0..order.len())
        .map(|_| notifications.recv_timeout(Duration::from_secs(5)).unwrap().1)
        .collect();
    assert_eq!(received, order);
}

#[test]
fn tasks_after_shutdown_are_dropped() {
    let queue = queue_with_capacity(4);
    queue.shutdown();
    queue.queue_async(Task::Ping(3));
    queue.shutdown();
}

#[test]
#[should_panic(expected = "worker thread is gone")]
fn sync_task_after_shutdown_panics() {
    let queue = queue_with_capacity(4);
    queue.shutdown();
    queue.queue_sync(Task::Ping(5), false);
}

#[test]
fn worker_runs_nothing_after_its_stop_task() {
    let (notifier, notifications) = ChannelNotifier::new();
    let queue = TaskQueue::new(TaskQueueConfig::default(), Arc::new(notifier)).unwrap();
    queue.queue_async_batch([
        Task::SendPropertyNotification {
            device: 2,
            property: Property::IsRunning,
        },
        Task::StopWorkerThread,
        Task::SendPropertyNotification {
            device: 2,
            property: Property::AudibleState,
        },
    ]);
    queue.shutdown();
    let delivered: Vec<_> = notifications.try_iter().collect();
    assert_eq!(delivered, vec![(2, Property::IsRunning)]);
}

#[test]
fn tasks_left_behind_a_stop_task_are_released() {
    let queue = Arc::new(queue_with_capacity(4));
    let clients = Arc::new(Clients::new(2, APP_BUNDLE_ID, Arc::clone(&queue)));
    queue.queue_async_batch([
        Task::StopWorkerThread,
        Task::StartClientIo {
            clients: Arc::clone(&clients),
            client_id: 1,
        },
    ]);
    queue.shutdown();
    assert_eq!(Arc::strong_count(&clients), 1);

    queue.queue_async_start_client_io(&clients, 1);
    assert_eq!(Arc::strong_count(&clients), 1);
}
