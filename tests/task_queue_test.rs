use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use volume_kit::task_queue::TaskQueue;
use volume_kit::{ChannelNotifier, NullNotifier, Property, TaskQueueConfig};

#[test]
fn concurrent_sync_callers_each_get_their_own_result() {
    let queue = Arc::new(TaskQueue::new(TaskQueueConfig::default(), Arc::new(NullNotifier)).unwrap());
    let handles: Vec<_> = (0..8u64)
        .map(|thread_index| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..200u64 {
                    let token = thread_index * 1_000_000 + i;
                    let realtime = i % 2 == 0;
                    assert_eq!(queue.ping(realtime, token), token);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn async_tasks_keep_per_producer_order() {
    let (notifier, notifications) = ChannelNotifier::new();
    let config = TaskQueueConfig {
        free_list_capacity: 16,
        ..TaskQueueConfig::default()
    };
    let queue = Arc::new(TaskQueue::new(config, Arc::new(notifier)).unwrap());

    const PRODUCERS: u32 = 4;
    const PER_PRODUCER: u32 = 250;
    let handles: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    // The object id carries the producer and sequence number.
                    queue.queue_async_send_property_notification(
                        Property::AudibleState,
                        producer * 10_000 + seq,
                    );
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut next: HashMap<u32, u32> = HashMap::new();
    for _ in 0..PRODUCERS * PER_PRODUCER {
        let (device, property) = notifications.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(property, Property::AudibleState);
        let expected = next.entry(device / 10_000).or_insert(0);
        assert_eq!(device % 10_000, *expected);
        *expected += 1;
    }
    assert!(next.values().all(|count| *count == PER_PRODUCER));

    queue.ping(false, 0);
    assert_eq!(queue.free_tasks(), 16);
}

#[test]
fn shutdown_is_idempotent() {
    let queue = TaskQueue::new(TaskQueueConfig::default(), Arc::new(NullNotifier)).unwrap();
    assert_eq!(queue.ping(true, 5), 5);
    queue.shutdown();
    queue.shutdown();
    queue.queue_async_send_property_notification(Property::IsRunning, 2);
}
