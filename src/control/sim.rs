//! A simulated host: connects demo clients and drives IO cycles against a device.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dasp_signal::{self as signal, ConstHz, Signal, Sine};
use tracing::{debug, info};

use crate::client::{Client, ClientId};
use crate::config::APP_BUNDLE_ID;
use crate::device::{Device, IoOperation};
use crate::error::DeviceError;
use crate::property::PropertyValue;

/// Sample rate of the simulated hardware.
pub const SAMPLE_RATE: f64 = 48_000.0;
/// Frames per simulated IO cycle.
pub const BUFFER_FRAMES: u32 = 512;

const TONE_AMPLITUDE: f32 = 0.25;

/// Bundle id the demo session uses as the music player.
pub const DEMO_MUSIC_PLAYER: &str = "com.apple.Music";

/// A sine tone rendered into interleaved stereo buffers.
pub struct ToneSource {
    signal: Sine<ConstHz>,
    amplitude: f32,
}

impl ToneSource {
    /// A tone at `hz` peaking at `amplitude`.
    pub fn new(hz: f64, amplitude: f32) -> Self {
        Self {
            signal: signal::rate(SAMPLE_RATE).const_hz(hz).sine(),
            amplitude,
        }
    }

    /// Replace the contents of `out` with `frames` stereo frames of the tone.
    pub fn render(&mut self, frames: u32, out: &mut Vec<f32>) {
        out.clear();
        for _ in 0..frames {
            let sample = self.signal.next() as f32 * self.amplitude;
            out.push(sample);
            out.push(sample);
        }
    }
}

/// `frames` stereo frames of a sine tone.
pub fn sine_buffer(frames: u32, hz: f64, amplitude: f32) -> Vec<f32> {
    let mut out = Vec::with_capacity(frames as usize * 2);
    ToneSource::new(hz, amplitude).render(frames, &mut out);
    out
}

/// Connect a handful of demo clients, make one of them the music player and start IO for two.
pub fn seed_demo_session(device: &Device) -> Result<(), DeviceError> {
    let demo = [
        (1, 501, Some("com.apple.Safari")),
        (2, 502, Some("com.apple.WebKit.WebContent")),
        (3, 503, Some(DEMO_MUSIC_PLAYER)),
        (4, 504, Some(APP_BUNDLE_ID)),
        (5, 505, None),
    ];
    for (client_id, pid, bundle_id) in demo {
        device.add_client(Client::new(client_id, pid, bundle_id, true))?;
    }
    device.set_property(PropertyValue::MusicPlayerBundleId(DEMO_MUSIC_PLAYER.to_owned()))?;
    device.start_io(2)?;
    device.start_io(3)?;
    Ok(())
}

/// Renders one buffer per client doing IO, mixes them and hands everything to the device.
pub struct CycleDriver {
    tones: HashMap<ClientId, ToneSource>,
    client_buffer: Vec<f32>,
    mix: Vec<f32>,
    sample_time: f64,
}

impl Default for CycleDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleDriver {
    /// Start at sample time zero.
    pub fn new() -> Self {
        Self {
            tones: HashMap::new(),
            client_buffer: Vec::with_capacity(BUFFER_FRAMES as usize * 2),
            mix: vec![0.0; BUFFER_FRAMES as usize * 2],
            sample_time: 0.0,
        }
    }

    /// Sample time of the next cycle.
    pub fn sample_time(&self) -> f64 {
        self.sample_time
    }

    /// Run one IO cycle. Returns whether the audible state changed.
    pub fn run_cycle(&mut self, device: &Device) -> bool {
        self.mix.iter_mut().for_each(|s| *s = 0.0);
        let active: Vec<Client> = device
            .clients()
            .client_map()
            .clients()
            .into_iter()
            .filter(|c| c.doing_io)
            .collect();

        for client in &active {
            let tone = self.tones.entry(client.client_id).or_insert_with(|| {
                ToneSource::new(220.0 + 110.0 * f64::from(client.client_id % 5), TONE_AMPLITUDE)
            });
            tone.render(BUFFER_FRAMES, &mut self.client_buffer);
            device.begin_io_operation(client.client_id, IoOperation::ProcessOutput);
            device.process_output(
                client.client_id,
                BUFFER_FRAMES,
                self.sample_time,
                &mut self.client_buffer,
            );
            device.end_io_operation(client.client_id, IoOperation::ProcessOutput);
            for (out, sample) in self.mix.iter_mut().zip(&self.client_buffer) {
                *out = (*out + sample).clamp(-1.0, 1.0);
            }
        }
        self.tones
            .retain(|id, _| active.iter().any(|c| c.client_id == *id));

        let changed = device.write_mix(BUFFER_FRAMES, self.sample_time, &self.mix);
        self.sample_time += f64::from(BUFFER_FRAMES);
        changed
    }
}

/// Drives IO cycles on a background thread at roughly the hardware's pace.
pub struct SimulatedHost {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatedHost {
    /// Start cycling `device`.
    pub fn start(device: Arc<Device>) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let period = Duration::from_secs_f64(f64::from(BUFFER_FRAMES) / SAMPLE_RATE);
        let thread = thread::Builder::new()
            .name("volumectl-io".into())
            .spawn(move || {
                let mut driver = CycleDriver::new();
                while !thread_stop.load(Ordering::Acquire) {
                    if driver.run_cycle(&device) {
                        debug!(state = ?device.audible_state(), "audible state changed");
                    }
                    thread::sleep(period);
                }
            })?;
        info!("simulated host started");
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for SimulatedHost {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
