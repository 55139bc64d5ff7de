use std::sync::Arc;

use crossbeam_channel::Receiver;

use volume_kit::clients::IoCounts;
use volume_kit::control::sim::{CycleDriver, DEMO_MUSIC_PLAYER, seed_demo_session, sine_buffer};
use volume_kit::device::{apply_volume_and_pan, pan_gains};
use volume_kit::property::EnabledOutputControls;
use volume_kit::{
    AppVolume, AudibleState, ChannelNotifier, Client, ClientError, Device, DeviceConfig,
    DeviceError, IoOperation, NullNotifier, ObjectId, Property, PropertyValue,
};

fn notifying_device() -> (Arc<Device>, Receiver<(ObjectId, Property)>) {
    let (notifier, notifications) = ChannelNotifier::new();
    let device = Device::new(DeviceConfig::default(), Arc::new(notifier)).unwrap();
    (device, notifications)
}

fn drain(device: &Device, rx: &Receiver<(ObjectId, Property)>) -> Vec<Property> {
    device.task_queue().ping(false, 0);
    device.task_queue().ping(false, 0);
    rx.try_iter().map(|(_, property)| property).collect()
}

fn assert_close(actual: f32, expected: f32) {
    assert!((actual - expected).abs() < 1e-6, "{actual} != {expected}");
}

#[test]
fn pan_attenuates_the_opposite_side() {
    assert_eq!(pan_gains(0), [1.0, 1.0]);
    assert_eq!(pan_gains(100), [0.0, 1.0]);
    assert_eq!(pan_gains(-100), [1.0, 0.0]);
    assert_eq!(pan_gains(50), [0.5, 1.0]);
    assert_eq!(pan_gains(-250), [1.0, 0.0]);
}

#[test]
fn volume_and_pan_are_applied_and_clamped() {
    let mut buffer = vec![0.5_f32; 8];
    apply_volume_and_pan(4, &mut buffer, 1.0, 0);
    assert!(buffer.iter().all(|s| *s == 0.5));

    apply_volume_and_pan(4, &mut buffer, 4.0, 0);
    assert!(buffer.iter().all(|s| *s == 1.0));

    let mut buffer = vec![-0.4_f32; 8];
    apply_volume_and_pan(2, &mut buffer, 0.5, -50);
    assert_eq!(&buffer[..4], &[-0.2, -0.1, -0.2, -0.1]);
    // Frames past `frames` are left alone.
    assert_eq!(&buffer[4..], &[-0.4; 4]);
}

#[test]
fn process_output_uses_the_clients_settings() {
    let device = Device::new(DeviceConfig::default(), Arc::new(NullNotifier)).unwrap();
    device.add_client(Client::new(1, 100, None, true)).unwrap();
    device.add_client(Client::new(2, 200, None, true)).unwrap();
    device
        .set_property(PropertyValue::AppVolumes(vec![
            AppVolume::new(Some(100), None).with_volume(25).with_pan(50),
        ]))
        .unwrap();

    let mut adjusted = vec![0.4_f32; 64];
    device.process_output(1, 32, 0.0, &mut adjusted);
    for frame in adjusted.chunks_exact(2) {
        assert_close(frame[0], 0.05);
        assert_close(frame[1], 0.1);
    }

    let mut untouched = vec![0.4_f32; 64];
    device.process_output(2, 32, 0.0, &mut untouched);
    assert!(untouched.iter().all(|s| *s == 0.4));

    // Unknown clients are passed through.
    let mut unknown = vec![0.4_f32; 64];
    device.process_output(9, 32, 0.0, &mut unknown);
    assert!(unknown.iter().all(|s| *s == 0.4));
}

#[test]
fn audible_state_follows_the_mix() {
    let (device, rx) = notifying_device();
    seed_demo_session(&device).unwrap();
    let mut driver = CycleDriver::new();
    let run = |driver: &mut CycleDriver, cycles: usize| {
        for _ in 0..cycles {
            driver.run_cycle(&device);
        }
    };

    assert_eq!(device.audible_state(), AudibleState::Silent);
    run(&mut driver, 24);
    assert_eq!(device.audible_state(), AudibleState::Audible);
    assert_eq!(
        device.property(Property::AudibleState),
        PropertyValue::AudibleState(AudibleState::Audible)
    );

    // Only the music player is left.
    device.stop_io(2).unwrap();
    run(&mut driver, 24);
    assert_eq!(device.audible_state(), AudibleState::SilentExceptMusic);

    device.stop_io(3).unwrap();
    assert!(!device.is_running());
    run(&mut driver, 24);
    assert_eq!(device.audible_state(), AudibleState::Silent);
    assert_eq!(driver.sample_time(), 72.0 * 512.0);

    let audible_notifications = drain(&device, &rx)
        .into_iter()
        .filter(|p| *p == Property::AudibleState)
        .count();
    assert_eq!(audible_notifications, 3);
}

#[test]
fn write_mix_reports_changes_once() {
    let config = DeviceConfig {
        audible_hysteresis_frames: 512,
        ..DeviceConfig::default()
    };
    let device = Device::new(config, Arc::new(NullNotifier)).unwrap();
    device.add_client(Client::new(1, 100, None, true)).unwrap();
    device.start_io(1).unwrap();

    let mut tone = sine_buffer(512, 440.0, 0.5);
    let mut changes = 0;
    for cycle in 0..8 {
        let sample_time = f64::from(cycle * 512);
        device.process_output(1, 512, sample_time, &mut tone);
        if device.write_mix(512, sample_time, &tone) {
            changes += 1;
        }
    }
    assert_eq!(changes, 1);
    assert_eq!(device.audible_state(), AudibleState::Audible);
}

#[test]
fn restarting_io_resets_the_audible_state() {
    let config = DeviceConfig {
        audible_hysteresis_frames: 512,
        ..DeviceConfig::default()
    };
    let device = Device::new(config, Arc::new(NullNotifier)).unwrap();
    device.add_client(Client::new(1, 100, None, true)).unwrap();

    let mut tone = sine_buffer(512, 440.0, 0.5);
    let mut run_cycles = |device: &Device| {
        let mut changes = 0;
        for cycle in 0..8 {
            let sample_time = f64::from(cycle * 512);
            device.process_output(1, 512, sample_time, &mut tone);
            if device.write_mix(512, sample_time, &tone) {
                changes += 1;
            }
        }
        changes
    };

    device.start_io(1).unwrap();
    assert_eq!(run_cycles(&device), 1);
    assert_eq!(device.audible_state(), AudibleState::Audible);

    device.stop_io(1).unwrap();
    device.start_io(1).unwrap();
    assert_eq!(device.audible_state(), AudibleState::Silent);
    assert_eq!(run_cycles(&device), 1);
    assert_eq!(device.audible_state(), AudibleState::Audible);
}

#[test]
fn read_only_properties_cannot_be_set() {
    let (device, _rx) = notifying_device();
    for value in [
        PropertyValue::IsRunning(true),
        PropertyValue::AudibleState(AudibleState::Audible),
        PropertyValue::RunningSomewhereOtherThanApp(true),
    ] {
        let property = value.property();
        assert!(!property.is_settable());
        assert!(matches!(
            device.set_property(value),
            Err(DeviceError::ReadOnlyProperty(p)) if p == property
        ));
    }
}

#[test]
fn music_player_by_pid_or_bundle_id() {
    let (device, rx) = notifying_device();
    device.add_client(Client::new(1, 100, Some(DEMO_MUSIC_PLAYER), true)).unwrap();
    device.add_client(Client::new(2, 200, None, true)).unwrap();
    let is_music_player = |id| device.clients().is_music_player_rt(id);

    device.set_property(PropertyValue::MusicPlayerProcessId(200)).unwrap();
    assert!(is_music_player(2));
    assert!(!is_music_player(1));
    assert_eq!(
        device.property(Property::MusicPlayerProcessId),
        PropertyValue::MusicPlayerProcessId(200)
    );
    assert_eq!(
        device.property(Property::MusicPlayerBundleId),
        PropertyValue::MusicPlayerBundleId(String::new())
    );
    assert_eq!(
        drain(&device, &rx),
        vec![Property::MusicPlayerProcessId, Property::MusicPlayerBundleId]
    );

    device
        .set_property(PropertyValue::MusicPlayerBundleId(DEMO_MUSIC_PLAYER.to_owned()))
        .unwrap();
    assert!(is_music_player(1));
    assert!(!is_music_player(2));
    assert_eq!(
        device.property(Property::MusicPlayerProcessId),
        PropertyValue::MusicPlayerProcessId(0)
    );
    assert_eq!(drain(&device, &rx).len(), 2);

    // Unchanged.
    device
        .set_property(PropertyValue::MusicPlayerBundleId(DEMO_MUSIC_PLAYER.to_owned()))
        .unwrap();
    assert!(drain(&device, &rx).is_empty());

    // Clients connecting later pick up the setting.
    device.add_client(Client::new(3, 300, Some(DEMO_MUSIC_PLAYER), true)).unwrap();
    assert!(is_music_player(3));

    assert!(matches!(
        device.set_property(PropertyValue::MusicPlayerProcessId(-5)),
        Err(DeviceError::Client(ClientError::InvalidProcessId(-5)))
    ));
    assert!(is_music_player(1));

    device.set_property(PropertyValue::MusicPlayerBundleId(String::new())).unwrap();
    assert!(!is_music_player(1) && !is_music_player(3));
}

#[test]
fn enabled_output_controls() {
    let (device, rx) = notifying_device();
    assert_eq!(
        device.property(Property::EnabledOutputControls),
        PropertyValue::EnabledOutputControls(EnabledOutputControls::default())
    );
    let disabled = EnabledOutputControls {
        volume: false,
        mute: true,
    };
    device
        .set_property(PropertyValue::EnabledOutputControls(disabled))
        .unwrap();
    assert_eq!(
        device.property(Property::EnabledOutputControls),
        PropertyValue::EnabledOutputControls(disabled)
    );
    assert_eq!(drain(&device, &rx), vec![Property::EnabledOutputControls]);

    device
        .set_property(PropertyValue::EnabledOutputControls(disabled))
        .unwrap();
    assert!(drain(&device, &rx).is_empty());
}

#[test]
fn status_of_the_demo_session() {
    let device = Device::new(DeviceConfig::default(), Arc::new(NullNotifier)).unwrap();
    seed_demo_session(&device).unwrap();
    device.task_queue().ping(false, 0);
    device.task_queue().ping(false, 0);

    let status = device.status();
    assert_eq!(
        status.clients.iter().map(|c| c.client_id).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5]
    );
    assert_eq!(status.io_counts, IoCounts { total: 2, excluding_app: 2 });
    assert!(status.is_running);
    assert_eq!(status.audible_state, AudibleState::Silent);
    assert_eq!(status.music_player_pid, 0);
    assert_eq!(status.music_player_bundle_id, DEMO_MUSIC_PLAYER);
    assert!(status.app_volumes.is_empty());
    assert_eq!(status.free_tasks, 512);
    assert!(status.clients.iter().any(|c| c.client_id == 3 && c.is_music_player));
}

#[test]
fn io_operation_codes() {
    assert_eq!(IoOperation::from_code(u32::from_be_bytes(*b"thrd")), Some(IoOperation::Thread));
    assert_eq!(IoOperation::from_code(u32::from_be_bytes(*b"mixo")), Some(IoOperation::WriteMix));
    assert_eq!(IoOperation::from_code(0), None);
}
