//! Classifies the device's output as silent, silent except for music, or audible.
//!
//! The IO thread feeds every client's unmixed buffer through
//! [`AudibleStateDetector::update_with_client_io`] and then the mixed buffer through
//! [`AudibleStateDetector::update_with_mixed_io`]. Each update moves one of four sample-time
//! watermarks forward. The classification only changes once the new condition has held for
//! the configured number of frames, which keeps the companion app from pausing and unpausing
//! the music player on short sounds.

use std::sync::atomic::{AtomicU32, Ordering};

use dasp_frame::{Frame, Stereo};

/// Frames a new condition has to hold before the state changes.
pub const DEFAULT_HYSTERESIS_FRAMES: u32 = 4096;

/// Largest deviation from the first frame that still counts as silence.
pub const SAMPLE_MARGIN: f32 = 1e-4;

pub(crate) const fn four_cc(code: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*code)
}

/// Audible state published as the `daud` device property.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AudibleState {
    /// Nothing is playing.
    Silent = four_cc(b"silt"),
    /// Only the music player is playing.
    SilentExceptMusic = four_cc(b"olym"),
    /// Something other than the music player is playing.
    Audible = four_cc(b"audi"),
}

impl AudibleState {
    /// Four-character code of the state.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Parse a four-character code.
    pub fn from_code(code: u32) -> Option<Self> {
        [Self::Silent, Self::SilentExceptMusic, Self::Audible]
            .into_iter()
            .find(|state| state.code() == code)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct SampleTimes {
    latest_silent: f64,
    latest_audible_non_music: f64,
    latest_silent_music: f64,
    latest_audible_music: f64,
}

/// Hysteresis based audible state classifier.
///
/// Updates take `&mut self`, so the owner serializes them. The state itself is stored
/// atomically and [`state`](Self::state) can be read from any thread holding a shared
/// reference.
#[derive(Debug)]
pub struct AudibleStateDetector {
    state: AtomicU32,
    hysteresis: f64,
    times: SampleTimes,
}

impl Default for AudibleStateDetector {
    fn default() -> Self {
        Self::new(DEFAULT_HYSTERESIS_FRAMES)
    }
}

impl AudibleStateDetector {
    /// Create a silent detector.
    pub fn new(hysteresis_frames: u32) -> Self {
        Self {
            state: AtomicU32::new(AudibleState::Silent.code()),
            hysteresis: hysteresis_frames as f64,
            times: SampleTimes::default(),
        }
    }

    /// Current classification.
    pub fn state(&self) -> AudibleState {
        AudibleState::from_code(self.state.load(Ordering::Acquire)).unwrap_or(AudibleState::Silent)
    }

    /// Back to silent with every watermark cleared. Called when IO starts.
    pub fn reset(&mut self) {
        self.set_state(AudibleState::Silent);
        self.times = SampleTimes::default();
    }

    /// Record one client's unmixed buffer for this cycle.
    pub fn update_with_client_io(
        &mut self,
        is_music_player: bool,
        frames: u32,
        sample_time: f64,
        buffer: &[f32],
    ) {
        let end = end_sample_time(frames, sample_time);
        if is_music_player {
            if buffer_is_audible(frames, buffer) {
                self.times.latest_audible_music = self.times.latest_audible_music.max(end);
            } else {
                self.times.latest_silent_music = self.times.latest_silent_music.max(end);
            }
        } else if end > self.times.latest_audible_non_music && buffer_is_audible(frames, buffer) {
            self.times.latest_audible_non_music = end;
        }
    }

    /// Record the mixed buffer for this cycle and reclassify. Returns `true` if the state
    /// changed.
    pub fn update_with_mixed_io(&mut self, frames: u32, sample_time: f64, buffer: &[f32]) -> bool {
        let end = end_sample_time(frames, sample_time);
        if !buffer_is_audible(frames, buffer) {
            self.times.latest_silent = self.times.latest_silent.max(end);
        }
        self.recalculate(end)
    }

    fn recalculate(&mut self, end: f64) -> bool {
        let t = self.times;
        let h = self.hysteresis;
        let since_silent = end - t.latest_silent;
        let since_music_silent = end - t.latest_silent_music;
        let since_audible = end - t.latest_audible_non_music;
        let since_music_audible = end - t.latest_audible_music;

        let current = self.state();
        let next = if current != AudibleState::Audible
            && since_silent >= h
            && since_audible <= 0.0
            && t.latest_audible_non_music != 0.0
        {
            AudibleState::Audible
        } else if ((current == AudibleState::Silent && since_music_silent >= h)
            || (current == AudibleState::Audible
                && since_audible >= h
                && since_music_silent >= h))
            && since_music_audible <= 0.0
            && t.latest_audible_music != 0.0
        {
            AudibleState::SilentExceptMusic
        } else if current != AudibleState::Silent && since_audible >= h && since_music_audible >= h
        {
            AudibleState::Silent
        } else {
            return false;
        };

        self.set_state(next);
        true
    }

    fn set_state(&self, state: AudibleState) {
        self.state.store(state.code(), Ordering::Release);
    }
}

fn end_sample_time(frames: u32, sample_time: f64) -> f64 {
    sample_time + frames as f64 - 1.0
}

/// Whether any frame of an interleaved stereo buffer strays from the first frame by more than
/// [`SAMPLE_MARGIN`].
///
/// This errs toward silence: a slowly decaying tail or a constant offset counts as silent.
pub fn buffer_is_audible(frames: u32, buffer: &[f32]) -> bool {
    let len = (frames as usize * 2).min(buffer.len() - buffer.len() % 2);
    let mut stereo = buffer[..len].chunks_exact(2).map(|s| -> Stereo<f32> { [s[0], s[1]] });
    let Some(first) = stereo.next() else {
        return false;
    };
    let lower: Stereo<f32> = first.map(|s| s - SAMPLE_MARGIN);
    let upper: Stereo<f32> = first.map(|s| s + SAMPLE_MARGIN);
    stereo.any(|frame| {
        frame
            .channels()
            .zip(lower.channels().zip(upper.channels()))
            .any(|(s, (lo, hi))| s < lo || s > hi)
    })
}
