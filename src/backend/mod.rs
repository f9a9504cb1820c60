//! Backend seam between the sound model and the two native mixers.
//!
//! Exactly two production implementations exist: [`tempo::TempoMixer`]
//! (kira, hardware-style rate control) and [`mix::StreamMixer`] (software
//! mix bus over cpal with symphonia decode). The active one is chosen once
//! at process start; nothing is loaded at runtime.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::config::AudioConfig;
use crate::engine::device::{DriverKind, OutputDevice};

pub mod mix;
pub mod tempo;

#[cfg(test)]
pub mod mock;

/// How a speed change is realized on a voice.
///
/// The two modes are mutually exclusive; applying one must reset the other
/// to neutral so they never compound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedMode {
    /// Rate change through a time-stretch stage; pitch is unaffected.
    TempoPreserving,
    /// Rate change by rewriting the output sample rate; pitch shifts with it.
    PitchCoupled,
}

/// Immutable description of one sound asset, fixed at creation.
#[derive(Debug, Clone)]
pub struct SoundDesc {
    pub path: PathBuf,
    /// Continuously decoded (music) vs. fully buffered one-shot (effect).
    pub stream: bool,
    /// Whether multiple instances may play at once (samples only).
    pub overlayable: bool,
    pub looped: bool,
}

/// Everything a mixer needs to start (or restart) one voice.
#[derive(Debug, Clone)]
pub struct PlayParams {
    /// Voice volume before the mixer's master volume is applied.
    pub volume: f32,
    /// Stereo pan in [-1, 1].
    pub pan: f32,
    /// Pitch multiplier in [0, 2], 1.0 = unchanged.
    pub pitch: f32,
    /// Speed multiplier in [0.05, 50].
    pub speed: f32,
    pub speed_mode: SpeedMode,
    pub looped: bool,
    /// Start offset for seek-restarts; 0 for a fresh play.
    pub start_ms: f64,
    /// Start the voice paused (backward-seek rebuilds while paused).
    pub paused: bool,
    /// Exempt from voice stealing (background music must never be cut).
    pub protected: bool,
}

impl Default for PlayParams {
    fn default() -> Self {
        Self {
            volume: 1.0,
            pan: 0.0,
            pitch: 1.0,
            speed: 1.0,
            speed_mode: SpeedMode::TempoPreserving,
            looped: false,
            start_ms: 0.0,
            paused: false,
            protected: false,
        }
    }
}

/// A successfully opened decode source plus the facts learned while opening.
pub struct OpenedSource<S> {
    pub source: S,
    /// Total length in milliseconds, computed once at open.
    pub length_ms: u64,
    /// Source sample rate, the reference point for frequency overrides.
    pub base_sample_rate: u32,
}

/// One actively mixed playback instance.
///
/// A voice can be invalidated behind the crate's back (auto-freed when it
/// finishes, or orphaned by a device rebuild); every accessor re-checks
/// validity and an invalid voice must read as stopped, never panic.
pub trait Voice {
    fn is_valid(&self) -> bool;
    fn is_playing(&self) -> bool;
    /// Raw backend position readout in milliseconds. Coarse and jittery;
    /// callers smooth it through the playback interpolator.
    fn raw_position_ms(&self) -> f64;

    fn pause(&mut self);
    fn resume(&mut self);
    fn stop(&mut self);

    fn set_volume(&mut self, volume: f32);
    fn set_pan(&mut self, pan: f32);
    fn set_speed(&mut self, speed: f32, mode: SpeedMode);
    fn set_pitch(&mut self, pitch: f32);
    /// Frequency override as a ratio to the source sample rate; 1.0 resets.
    fn set_frequency_ratio(&mut self, ratio: f32);
    fn set_looped(&mut self, looped: bool);

    /// Cheap in-place decode-to-target. Only valid for `target_ms` at or
    /// ahead of the current raw position.
    fn seek_forward_ms(&mut self, target_ms: f64) -> Result<()>;
    /// Fast, reduced-precision seek for non-gameplay contexts.
    fn seek_fast_ms(&mut self, target_ms: f64) -> Result<()>;
}

/// One native mixer context.
///
/// `open_source` is deliberately an associated function with no receiver so
/// the async load worker can run it off-thread while the mixer itself stays
/// on the main thread.
pub trait Mixer {
    type Source: Send + 'static;
    type Voice: Voice;

    /// Driver family reported in the device catalogue.
    const DRIVER: DriverKind;

    /// (Re)build the output context on the given device. Tears down any
    /// previous context first; existing voices become invalid. Blocks the
    /// caller for the duration, which can be several hundred milliseconds.
    fn init(&mut self, device: &OutputDevice, config: &AudioConfig) -> Result<()>;
    fn shutdown(&mut self);
    fn is_ready(&self) -> bool;

    fn set_master_volume(&mut self, volume: f32);
    fn set_voice_ceiling(&mut self, ceiling: u32);
    fn active_voice_count(&self) -> usize;

    /// Validate and open a decodable source. Runs on the load worker.
    fn open_source(
        path: &Path,
        desc: &SoundDesc,
        config: &AudioConfig,
    ) -> Result<OpenedSource<Self::Source>>;

    /// Allocate a voice for the source and start it (or park it paused).
    fn play(&mut self, source: &mut Self::Source, params: &PlayParams) -> Result<Self::Voice>;
}
