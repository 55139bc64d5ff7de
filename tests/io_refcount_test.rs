use std::sync::{Arc, Weak};

use crossbeam_channel::Receiver;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use volume_kit::clients::IoCounts;
use volume_kit::config::APP_BUNDLE_ID;
use volume_kit::{
    ChannelNotifier, Client, ClientError, Device, DeviceConfig, DeviceError, HostNotifier,
    IoOperation, ObjectId, Property, PropertyValue,
};

const APP: u32 = 10;

fn device() -> (Arc<Device>, Receiver<(ObjectId, Property)>) {
    let (notifier, notifications) = ChannelNotifier::new();
    let device = Device::new(DeviceConfig::default(), Arc::new(notifier)).unwrap();
    for client_id in 1..=4 {
        device
            .add_client(Client::new(client_id, 100 + client_id as i32, None, true))
            .unwrap();
    }
    device
        .add_client(Client::new(APP, 900, Some(APP_BUNDLE_ID), true))
        .unwrap();
    (device, notifications)
}

/// Every notification queued so far. Tasks on the non-real-time worker run in order, so a
/// ping returning means everything queued before it has been sent. The second ping covers
/// notifications queued by async tasks that ran in the first batch.
fn notifications(device: &Device, rx: &Receiver<(ObjectId, Property)>) -> Vec<Property> {
    device.task_queue().ping(false, 0);
    device.task_queue().ping(false, 0);
    rx.try_iter().map(|(_, property)| property).collect()
}

fn counts(device: &Device) -> IoCounts {
    device.clients().io_counts()
}

#[test]
fn device_starts_with_the_first_client_and_stops_with_the_last() {
    let (device, rx) = device();
    assert!(!device.is_running());

    device.start_io(1).unwrap();
    assert!(device.is_running());
    assert_eq!(
        notifications(&device, &rx),
        vec![Property::IsRunning, Property::RunningSomewhereOtherThanApp]
    );

    device.start_io(2).unwrap();
    assert!(notifications(&device, &rx).is_empty());
    assert_eq!(counts(&device), IoCounts { total: 2, excluding_app: 2 });

    device.stop_io(1).unwrap();
    assert!(device.is_running());
    assert!(notifications(&device, &rx).is_empty());

    device.stop_io(2).unwrap();
    assert!(!device.is_running());
    assert_eq!(
        notifications(&device, &rx),
        vec![Property::IsRunning, Property::RunningSomewhereOtherThanApp]
    );
    assert_eq!(counts(&device), IoCounts::default());
}

#[test]
fn companion_app_is_not_running_somewhere_else() {
    let (device, rx) = device();
    assert_eq!(device.clients().app_client_id(), Some(APP));

    device.start_io(APP).unwrap();
    assert_eq!(notifications(&device, &rx), vec![Property::IsRunning]);
    assert_eq!(counts(&device), IoCounts { total: 1, excluding_app: 0 });
    assert!(!device.clients().clients_running_io_other_than_app());

    device.start_io(3).unwrap();
    assert_eq!(
        notifications(&device, &rx),
        vec![Property::RunningSomewhereOtherThanApp]
    );
    assert!(device.clients().clients_running_io_other_than_app());

    device.stop_io(3).unwrap();
    assert_eq!(
        notifications(&device, &rx),
        vec![Property::RunningSomewhereOtherThanApp]
    );
    assert!(device.is_running());

    device.stop_io(APP).unwrap();
    assert_eq!(notifications(&device, &rx), vec![Property::IsRunning]);
    assert!(!device.is_running());
}

#[test]
fn repeated_start_and_stop_are_ignored() {
    let (device, _rx) = device();
    device.start_io(1).unwrap();
    device.start_io(1).unwrap();
    assert_eq!(counts(&device), IoCounts { total: 1, excluding_app: 1 });
    device.stop_io(1).unwrap();
    device.stop_io(1).unwrap();
    assert_eq!(counts(&device), IoCounts::default());
    device.stop_io(2).unwrap();
    assert_eq!(counts(&device), IoCounts::default());
}

#[test]
fn unknown_clients_are_rejected() {
    let (device, _rx) = device();
    assert!(matches!(
        device.start_io(77),
        Err(DeviceError::Client(ClientError::InvalidClient(77)))
    ));
    assert!(matches!(
        device.stop_io(77),
        Err(DeviceError::Client(ClientError::InvalidClient(77)))
    ));
    assert!(!device.is_running());
}

#[test]
fn disconnecting_during_io_stops_the_device() {
    let (device, rx) = device();
    device.start_io(4).unwrap();
    let _ = notifications(&device, &rx);

    let removed = device.remove_client(4).unwrap();
    assert!(removed.doing_io);
    assert!(!device.is_running());
    assert_eq!(counts(&device), IoCounts::default());
    assert_eq!(
        notifications(&device, &rx),
        vec![Property::IsRunning, Property::RunningSomewhereOtherThanApp]
    );
}

#[test]
fn removing_the_app_forgets_its_client_id() {
    let (device, _rx) = device();
    device.remove_client(APP).unwrap();
    assert_eq!(device.clients().app_client_id(), None);
}

#[test]
fn io_thread_operations_are_counted_asynchronously() {
    let (device, rx) = device();
    device.begin_io_operation(2, IoOperation::Thread);
    device.begin_io_operation(2, IoOperation::Cycle);
    let sent = notifications(&device, &rx);
    assert_eq!(counts(&device), IoCounts { total: 1, excluding_app: 1 });
    assert!(sent.contains(&Property::RunningSomewhereOtherThanApp));

    device.end_io_operation(2, IoOperation::Thread);
    let _ = notifications(&device, &rx);
    assert_eq!(counts(&device), IoCounts::default());

    // A client that disconnected before its async task ran is ignored.
    device.begin_io_operation(99, IoOperation::Thread);
    let _ = notifications(&device, &rx);
    assert_eq!(counts(&device), IoCounts::default());
}

#[test]
fn random_interleavings_keep_the_counters_consistent() {
    let (device, rx) = device();
    let ids = [1, 2, 3, 4, APP];
    let mut doing_io = [false; 5];
    let mut transitions = 0;
    let mut seed: u32 = 0x2545_f491;

    for _ in 0..300 {
        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let index = (seed >> 16) as usize % ids.len();
        let running_before = doing_io.iter().any(|d| *d);
        if doing_io[index] {
            device.stop_io(ids[index]).unwrap();
        } else {
            device.start_io(ids[index]).unwrap();
        }
        doing_io[index] = !doing_io[index];
        let running_after = doing_io.iter().any(|d| *d);
        if running_before != running_after {
            transitions += 1;
        }

        let c = counts(&device);
        let total = doing_io.iter().filter(|d| **d).count() as u64;
        let excluding = doing_io[..4].iter().filter(|d| **d).count() as u64;
        assert_eq!(c, IoCounts { total, excluding_app: excluding });
        assert!(c.excluding_app == c.total || c.excluding_app + 1 == c.total);
        assert_eq!(device.is_running(), total > 0);
    }

    let is_running_notifications = notifications(&device, &rx)
        .into_iter()
        .filter(|p| *p == Property::IsRunning)
        .count();
    assert_eq!(is_running_notifications, transitions);
}

/// Host that reads `IsRunning` back as soon as it is told the property changed.
#[derive(Default)]
struct RunningObserver {
    device: OnceCell<Weak<Device>>,
    seen: Mutex<Vec<bool>>,
}

impl HostNotifier for RunningObserver {
    fn properties_changed(&self, _device: ObjectId, properties: &[Property]) {
        if !properties.contains(&Property::IsRunning) {
            return;
        }
        let Some(device) = self.device.get().and_then(Weak::upgrade) else {
            return;
        };
        if let PropertyValue::IsRunning(running) = device.property(Property::IsRunning) {
            self.seen.lock().push(running);
        }
    }
}

#[test]
fn is_running_is_current_when_its_notification_arrives() {
    let observer = Arc::new(RunningObserver::default());
    let device = Device::new(DeviceConfig::default(), observer.clone()).unwrap();
    assert!(observer.device.set(Arc::downgrade(&device)).is_ok());
    device
        .add_client(Client::new(1, 101, None, true))
        .unwrap();

    for _ in 0..200 {
        device.start_io(1).unwrap();
        device.task_queue().ping(false, 0);
        device.stop_io(1).unwrap();
        device.task_queue().ping(false, 0);
    }
    device.task_queue().ping(false, 0);

    let seen = observer.seen.lock().clone();
    assert_eq!(seen.len(), 400);
    for (i, running) in seen.iter().enumerate() {
        assert_eq!(*running, i % 2 == 0, "notification {i}");
    }
}

#[test]
fn is_running_follows_io_thread_operations() {
    let (device, rx) = device();
    device.begin_io_operation(1, IoOperation::Thread);
    device.task_queue().ping(false, 0);
    assert!(device.is_running());
    assert_eq!(device.property(Property::IsRunning), PropertyValue::IsRunning(true));

    device.end_io_operation(1, IoOperation::Thread);
    device.task_queue().ping(false, 0);
    assert!(!device.is_running());
    assert_eq!(
        notifications(&device, &rx)
            .into_iter()
            .filter(|p| *p == Property::IsRunning)
            .count(),
        2
    );
}
