//! The sound resource model.
//!
//! A [`Sound`] represents one loaded (or loading) audio asset and mediates
//! between playback intent and the active mixer's voice model. It is
//! main-thread only; the asynchronous part of loading lives behind a
//! [`LoadSlot`] that `update` polls.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, warn};

use crate::backend::{Mixer, PlayParams, SoundDesc, SpeedMode, Voice};
use crate::config::AudioConfig;
use crate::interpolator::PlaybackInterpolator;
use crate::loader::{LoadSlot, LoadState};

pub const SPEED_MIN: f32 = 0.05;
pub const SPEED_MAX: f32 = 50.0;
pub const PITCH_MIN: f32 = 0.0;
pub const PITCH_MAX: f32 = 2.0;
pub const VOLUME_MIN: f32 = 0.0;
pub const VOLUME_MAX: f32 = 2.0;
pub const FREQUENCY_MIN: f32 = 100.0;
pub const FREQUENCY_MAX: f32 = 100_000.0;

pub struct Sound<M: Mixer> {
    desc: SoundDesc,
    source: Option<M::Source>,
    voices: Vec<M::Voice>,
    pending: Option<Arc<LoadSlot<M::Source>>>,

    ready: bool,
    async_ready: bool,
    ignored: bool,
    started: bool,

    volume: f32,
    pan: f32,
    speed: f32,
    pitch: f32,
    /// Output frequency override in Hz; 0 means "source default".
    frequency: f32,
    speed_mode: SpeedMode,

    base_sample_rate: u32,
    length_ms: u64,
    paused_position_ms: u32,
    /// Engine frame time of the last `play`, for same-frame rate limiting.
    pub(crate) last_play_time: f64,

    interpolator: PlaybackInterpolator,
    interpolate: bool,
    resume_scheduled: bool,
}

impl<M: Mixer> Sound<M> {
    pub(crate) fn new(
        desc: SoundDesc,
        pending: Arc<LoadSlot<M::Source>>,
        config: &AudioConfig,
    ) -> Self {
        Self {
            desc,
            source: None,
            voices: Vec::new(),
            pending: Some(pending),
            ready: false,
            async_ready: false,
            ignored: false,
            started: false,
            volume: 1.0,
            pan: 0.0,
            speed: 1.0,
            pitch: 1.0,
            frequency: 0.0,
            speed_mode: if config.pitch_coupled_speed {
                SpeedMode::PitchCoupled
            } else {
                SpeedMode::TempoPreserving
            },
            base_sample_rate: 0,
            length_ms: 0,
            paused_position_ms: 0,
            last_play_time: -1.0,
            interpolator: PlaybackInterpolator::new(),
            interpolate: config.interpolate_position,
            resume_scheduled: false,
        }
    }

    /// Poll the pending load; call every frame until ready or ignored.
    pub fn update(&mut self) {
        let Some(slot) = &self.pending else { return };
        if !slot.is_done() {
            return;
        }
        let slot = self.pending.take().expect("checked above");
        match slot.take() {
            LoadState::Loaded(opened) => {
                self.source = Some(opened.source);
                self.length_ms = opened.length_ms;
                self.base_sample_rate = opened.base_sample_rate;
                self.async_ready = true;
                self.ready = true;
                debug!(path = %self.desc.path.display(), length_ms = self.length_ms, "sound ready");
            }
            LoadState::Ignored => {
                self.ignored = true;
            }
            LoadState::Pending => {
                // done flag set but state not published; treat as ignored
                self.ignored = true;
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.desc.path
    }

    pub fn is_stream(&self) -> bool {
        self.desc.stream
    }

    pub fn is_overlayable(&self) -> bool {
        self.desc.overlayable
    }

    pub fn is_looped(&self) -> bool {
        self.desc.looped
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_async_ready(&self) -> bool {
        self.async_ready
    }

    pub fn is_ignored(&self) -> bool {
        self.ignored
    }

    pub fn length_ms(&self) -> u64 {
        self.length_ms
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn pan(&self) -> f32 {
        self.pan
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    /// Current frequency override; 0 when the source default is in effect.
    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    pub fn is_playing(&self) -> bool {
        self.voices.iter().any(|v| v.is_playing())
    }

    /// Started at least once and every voice has since gone away.
    pub fn is_finished(&self) -> bool {
        self.started && !self.voices.iter().any(|v| v.is_valid())
    }

    /// Stream-only operation guard. Misuse is a programmer error: loud in
    /// debug builds, a logged no-op in release.
    fn stream_guard(&self, op: &str) -> bool {
        if self.desc.stream {
            return true;
        }
        error!(
            path = %self.desc.path.display(),
            "{op} is only valid on streams"
        );
        debug_assert!(false, "{op} called on a non-stream sound");
        false
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(VOLUME_MIN, VOLUME_MAX);
        for voice in &mut self.voices {
            voice.set_volume(self.volume);
        }
    }

    pub fn set_pan(&mut self, pan: f32) {
        self.pan = pan.clamp(-1.0, 1.0);
        for voice in &mut self.voices {
            voice.set_pan(self.pan);
        }
    }

    pub fn set_looped(&mut self, looped: bool) {
        self.desc.looped = looped;
        for voice in &mut self.voices {
            voice.set_looped(looped);
        }
    }

    pub fn set_speed(&mut self, speed: f32) {
        if !self.stream_guard("setSpeed") {
            return;
        }
        self.speed = speed.clamp(SPEED_MIN, SPEED_MAX);
        let mode = self.speed_mode;
        for voice in &mut self.voices {
            voice.set_speed(self.speed, mode);
        }
    }

    /// Switch between the tempo-preserving and pitch-coupled speed modes.
    /// The modes are mutually exclusive; the inactive mode's parameter is
    /// reset to neutral so they never compound.
    pub fn set_pitch_coupled_speed(&mut self, pitch_coupled: bool) {
        let new_mode = if pitch_coupled {
            SpeedMode::PitchCoupled
        } else {
            SpeedMode::TempoPreserving
        };
        if new_mode == self.speed_mode {
            return;
        }
        self.speed_mode = new_mode;
        if new_mode == SpeedMode::TempoPreserving {
            // leaving pitch-coupled mode: drop the frequency override
            self.frequency = 0.0;
            for voice in &mut self.voices {
                voice.set_frequency_ratio(1.0);
            }
        }
        let (speed, mode) = (self.speed, self.speed_mode);
        for voice in &mut self.voices {
            voice.set_speed(speed, mode);
        }
    }

    pub fn set_pitch(&mut self, pitch: f32) {
        if !self.stream_guard("setPitch") {
            return;
        }
        self.pitch = pitch.clamp(PITCH_MIN, PITCH_MAX);
        for voice in &mut self.voices {
            voice.set_pitch(self.pitch);
        }
    }

    /// Override the output frequency in Hz. 0 resets to the source default;
    /// anything else is clamped to [100, 100000].
    pub fn set_frequency(&mut self, frequency: f32) {
        if !self.stream_guard("setFrequency") {
            return;
        }
        self.frequency = if frequency == 0.0 {
            0.0
        } else {
            frequency.clamp(FREQUENCY_MIN, FREQUENCY_MAX)
        };
        let ratio = self.frequency_ratio();
        for voice in &mut self.voices {
            voice.set_frequency_ratio(ratio);
        }
    }

    fn frequency_ratio(&self) -> f32 {
        if self.frequency == 0.0 || self.base_sample_rate == 0 {
            1.0
        } else {
            self.frequency / self.base_sample_rate as f32
        }
    }

    /// Smoothed playback position. `now` is wall-clock seconds.
    pub fn position_ms(&mut self, now: f64) -> u32 {
        if !self.ready {
            return 0;
        }
        let Some(voice) = self.voices.iter().find(|v| v.is_valid()) else {
            return self.paused_position_ms;
        };
        let raw = voice.raw_position_ms();
        let playing = voice.is_playing();
        if !self.interpolate {
            return (raw.max(0.0) as u64).min(self.length_ms) as u32;
        }
        self.interpolator.update(
            raw,
            now,
            self.speed as f64,
            self.desc.looped,
            self.length_ms,
            playing,
        )
    }

    /// Position as a fraction of the total length.
    pub fn position(&mut self, now: f64) -> f32 {
        if self.length_ms == 0 {
            return 0.0;
        }
        self.position_ms(now) as f32 / self.length_ms as f32
    }

    /// Seek to an absolute position. Forward seeks decode in place; backward
    /// seeks rebuild the decode context from the file start, which is the
    /// expensive path. If playback was active the caller is signalled
    /// through [`Sound::resume_scheduled`] once the rebuilt voice is parked.
    pub fn set_position_ms(&mut self, mixer: &mut M, target_ms: f64, now: f64) -> Result<()> {
        if !self.stream_guard("setPositionMS") || !self.ready {
            return Ok(());
        }
        let target_ms = target_ms.clamp(0.0, self.length_ms as f64);

        self.prune_voices();
        let Some(voice) = self.voices.iter_mut().find(|v| v.is_valid()) else {
            self.paused_position_ms = target_ms as u32;
            self.interpolator.reset(target_ms, now, self.speed as f64);
            return Ok(());
        };

        if target_ms >= voice.raw_position_ms() {
            voice
                .seek_forward_ms(target_ms)
                .context("forward seek failed")?;
        } else {
            let was_playing = voice.is_playing();
            voice.stop();
            self.voices.clear();

            let params = self.play_params(target_ms, true);
            let source = self
                .source
                .as_mut()
                .expect("ready sound always has a source");
            match mixer.play(source, &params) {
                Ok(new_voice) => {
                    self.voices.push(new_voice);
                    if was_playing {
                        self.resume_scheduled = true;
                    }
                }
                Err(e) => {
                    warn!(path = %self.desc.path.display(), "seek rebuild failed: {e:#}");
                    self.paused_position_ms = target_ms as u32;
                }
            }
        }

        self.paused_position_ms = target_ms as u32;
        self.interpolator.reset(target_ms, now, self.speed as f64);
        Ok(())
    }

    /// Reduced-precision seek for browsing contexts; skips the
    /// forward/backward split entirely.
    pub fn set_position_ms_fast(&mut self, target_ms: f64, now: f64) -> Result<()> {
        if !self.stream_guard("setPositionMSFast") || !self.ready {
            return Ok(());
        }
        let target_ms = target_ms.clamp(0.0, self.length_ms as f64);
        if let Some(voice) = self.voices.iter_mut().find(|v| v.is_valid()) {
            voice.seek_fast_ms(target_ms).context("fast seek failed")?;
        }
        self.paused_position_ms = target_ms as u32;
        self.interpolator.reset(target_ms, now, self.speed as f64);
        Ok(())
    }

    /// Seek to a fraction of the total length.
    pub fn set_position(&mut self, mixer: &mut M, percent: f32, now: f64) -> Result<()> {
        let target = self.length_ms as f64 * percent.clamp(0.0, 1.0) as f64;
        self.set_position_ms(mixer, target, now)
    }

    /// Pause all voices and remember the position for the next resume.
    pub fn pause(&mut self, now: f64) {
        if !self.stream_guard("pause") {
            return;
        }
        if self.is_playing() {
            self.paused_position_ms = self.position_ms(now);
        }
        for voice in &mut self.voices {
            voice.pause();
        }
    }

    pub fn stop(&mut self) {
        for voice in &mut self.voices {
            voice.stop();
        }
        self.voices.clear();
        self.paused_position_ms = 0;
        self.resume_scheduled = false;
    }

    /// True when a backward-seek rebuild finished while playback was active
    /// and the caller should resume.
    pub fn resume_scheduled(&self) -> bool {
        self.resume_scheduled
    }

    pub(crate) fn take_resume_scheduled(&mut self) -> bool {
        std::mem::replace(&mut self.resume_scheduled, false)
    }

    /// Reset to the unloaded state with a new path; the engine re-queues the
    /// load. Used when a device rebuild invalidates backend sources.
    pub(crate) fn reset_for_rebuild(&mut self, new_path: PathBuf) {
        self.stop();
        self.desc.path = new_path;
        self.source = None;
        self.pending = None;
        self.ready = false;
        self.async_ready = false;
        self.ignored = false;
        self.started = false;
        self.length_ms = 0;
        self.base_sample_rate = 0;
        self.interpolator = PlaybackInterpolator::new();
    }

    pub(crate) fn set_pending(&mut self, slot: Arc<LoadSlot<M::Source>>) {
        self.pending = Some(slot);
    }

    pub(crate) fn desc(&self) -> &SoundDesc {
        &self.desc
    }

    pub(crate) fn prune_voices(&mut self) {
        self.voices.retain(|v| v.is_valid());
    }

    pub(crate) fn has_valid_voice(&self) -> bool {
        self.voices.iter().any(|v| v.is_valid())
    }

    pub(crate) fn resume_voices(&mut self) {
        for voice in &mut self.voices {
            voice.resume();
        }
    }

    /// Voice start parameters from the current transport state.
    pub(crate) fn play_params(&self, start_ms: f64, paused: bool) -> PlayParams {
        PlayParams {
            volume: self.volume,
            pan: self.pan,
            pitch: self.pitch,
            speed: self.speed,
            speed_mode: self.speed_mode,
            looped: self.desc.looped,
            start_ms,
            paused,
            // background music must never be cut by one-shot effects
            protected: self.desc.stream,
        }
    }

    /// Start a voice obtained from the mixer. Non-overlayable sounds
    /// reclaim their previous voice first (single-instance guarantee).
    pub(crate) fn start(&mut self, mixer: &mut M, start_ms: f64, now: f64) -> Result<()> {
        if !self.desc.overlayable {
            for voice in &mut self.voices {
                voice.stop();
            }
            self.voices.clear();
        } else {
            self.voices.retain(|v| v.is_valid());
        }
        let params = self.play_params(start_ms, false);
        let source = self
            .source
            .as_mut()
            .expect("ready sound always has a source");
        let mut new_voice = mixer.play(source, &params)?;
        let ratio = self.frequency_ratio();
        if ratio != 1.0 {
            new_voice.set_frequency_ratio(ratio);
        }
        self.voices.push(new_voice);
        self.started = true;
        self.interpolator.reset(start_ms, now, self.speed as f64);
        Ok(())
    }
}

impl<M: Mixer> Drop for Sound<M> {
    fn drop(&mut self) {
        // a stream voice decodes until told otherwise and must not outlive
        // its sound; one-shot samples are finite and may ring out
        if self.desc.stream {
            for voice in &mut self.voices {
                voice.stop();
            }
        }
    }
}
