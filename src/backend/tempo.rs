//! Tempo backend over kira.
//!
//! Samples load once into a [`StaticSoundData`] and cheap-clone per
//! overlayed play; their rate changes go through kira's playback-rate stage.
//!
//! Streams play through a custom kira sound fed by the same per-voice
//! decode pipeline the mix backend uses: a feeder thread pushes symphonia
//! output through the overlap-add stretcher into a ring, and the kira-side
//! [`StretchSound`] resamples out of that ring. Tempo-preserving speed is
//! realized as the stretch factor, so pitch stays put; pitch-coupled speed
//! folds into the resample ratio instead and shifts pitch with it.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use kira::OutputDestination;
use kira::clock::clock_info::ClockInfoProvider;
use kira::Frame;
use kira::manager::backend::DefaultBackend;
use kira::manager::{AudioManager, AudioManagerSettings, Capacities};
use kira::modulator::value_provider::ModulatorValueProvider;
use kira::sound::static_sound::{StaticSoundData, StaticSoundHandle};
use kira::sound::{PlaybackState, Sound as KiraSound, SoundData as KiraSoundData};
use kira::tween::Tween;
use tracing::{debug, info};

use crate::config::AudioConfig;
use crate::engine::device::OutputDevice;

use super::mix::stream::{StreamDecoder, StreamInfo};
use super::mix::{SeekRequest, StreamRing, feeder_loop, load_f32, store_f32, store_f64};
use super::{Mixer, OpenedSource, PlayParams, SoundDesc, SpeedMode, Voice};

/// Settle handle mutations immediately instead of over kira's default tween.
fn instant() -> Tween {
    Tween {
        duration: Duration::ZERO,
        ..Default::default()
    }
}

/// Stereo pan in [-1, 1] to kira's [0, 1] panning.
fn pan_to_kira(pan: f32) -> f64 {
    ((pan.clamp(-1.0, 1.0) + 1.0) / 2.0) as f64
}

/// Combined playback-rate factor for kira's rate stage (sample voices).
fn effective_rate(speed: f32, pitch: f32, freq_ratio: f32) -> f64 {
    (speed * pitch * freq_ratio) as f64
}

/// Split the user rates into (stretch factor, resample factor) for the
/// requested mode. Only the resample factor moves pitch.
fn stretch_rates(speed: f32, pitch: f32, freq_ratio: f32, mode: SpeedMode) -> (f32, f32) {
    match mode {
        SpeedMode::TempoPreserving => (speed, pitch * freq_ratio),
        SpeedMode::PitchCoupled => (1.0, speed * pitch * freq_ratio),
    }
}

/// A decodable asset as the tempo backend sees it.
pub enum TempoSource {
    Sample(StaticSoundData),
    Stream { path: PathBuf, info: StreamInfo },
}

/// Control block shared between a stream voice's kira-side sound and its
/// [`TempoVoice`] handle.
struct StretchCtrl {
    playing: AtomicBool,
    stop_requested: AtomicBool,
    finished: AtomicBool,
    /// Applied volume, master already multiplied in.
    volume: AtomicU32,
    /// Stereo pan in [-1, 1].
    pan: AtomicU32,
    /// Source frames consumed per output frame, as a fraction of the source
    /// rate. Pitch and frequency override live here; speed joins them only
    /// in pitch-coupled mode.
    resample: AtomicU32,
}

impl StretchCtrl {
    fn new(params: &PlayParams, master: f32) -> Self {
        let ctrl = Self {
            playing: AtomicBool::new(!params.paused),
            stop_requested: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            volume: AtomicU32::new(0),
            pan: AtomicU32::new(0),
            resample: AtomicU32::new(1.0f32.to_bits()),
        };
        store_f32(&ctrl.volume, params.volume * master);
        store_f32(&ctrl.pan, params.pan);
        ctrl
    }
}

/// Handle half of the custom stream sound; lives in [`TempoHandle`].
struct StretchHandle {
    ring: Arc<StreamRing>,
    ctrl: Arc<StretchCtrl>,
}

impl StretchHandle {
    fn state(&self) -> PlaybackState {
        if self.ctrl.finished.load(Ordering::Relaxed)
            || self.ctrl.stop_requested.load(Ordering::Relaxed)
        {
            PlaybackState::Stopped
        } else if self.ctrl.playing.load(Ordering::Relaxed) {
            PlaybackState::Playing
        } else {
            PlaybackState::Paused
        }
    }

    fn stop(&self) {
        self.ctrl.stop_requested.store(true, Ordering::Relaxed);
        self.ring.quit.store(true, Ordering::Relaxed);
    }

    fn request_seek(&self, target_ms: f64, accurate: bool) {
        if let Ok(mut req) = self.ring.seek_request.lock() {
            *req = Some(SeekRequest {
                target_ms,
                accurate,
            });
        }
    }
}

/// Renderer half of the custom stream sound. Pulls stretched source-rate
/// frames out of the shared ring and resamples them by the control block's
/// resample factor; on underrun it emits silence until the feeder catches
/// up.
struct StretchSound {
    ring: Arc<StreamRing>,
    ctrl: Arc<StretchCtrl>,
    src_rate: u32,
    /// Linear-interpolation state across process calls.
    frac: f64,
    cur: [f32; 2],
    nxt: [f32; 2],
    primed: bool,
}

impl StretchSound {
    fn next_frame(&mut self, dt: f64) -> Frame {
        if self.ctrl.stop_requested.load(Ordering::Relaxed) {
            self.ctrl.finished.store(true, Ordering::Relaxed);
            self.ring.quit.store(true, Ordering::Relaxed);
            return Frame::ZERO;
        }
        if self.ctrl.finished.load(Ordering::Relaxed)
            || !self.ctrl.playing.load(Ordering::Relaxed)
        {
            return Frame::ZERO;
        }

        let ch = self.ring.channels as usize;
        let Ok(mut buf) = self.ring.buf.lock() else {
            return Frame::ZERO;
        };
        let pop_frame = |buf: &mut VecDeque<f32>| -> Option<[f32; 2]> {
            if buf.len() < ch {
                return None;
            }
            let mut frame = [0.0f32; 2];
            for c in 0..ch {
                let s = buf.pop_front().unwrap_or(0.0);
                if c < 2 {
                    frame[c] = s;
                }
            }
            if ch == 1 {
                frame[1] = frame[0];
            }
            Some(frame)
        };

        if !self.primed {
            let (Some(a), Some(b)) = (pop_frame(&mut buf), pop_frame(&mut buf)) else {
                if self.ring.done.load(Ordering::Relaxed) {
                    self.ctrl.finished.store(true, Ordering::Relaxed);
                }
                return Frame::ZERO;
            };
            self.cur = a;
            self.nxt = b;
            self.primed = true;
        }

        let t = self.frac as f32;
        let l = self.cur[0] + (self.nxt[0] - self.cur[0]) * t;
        let r = self.cur[1] + (self.nxt[1] - self.cur[1]) * t;

        self.frac += load_f32(&self.ctrl.resample) as f64 * self.src_rate as f64 * dt;
        while self.frac >= 1.0 {
            self.frac -= 1.0;
            self.cur = self.nxt;
            match pop_frame(&mut buf) {
                Some(f) => self.nxt = f,
                None => {
                    // underrun: hold the last frame, re-prime later
                    self.primed = false;
                    if self.ring.done.load(Ordering::Relaxed) {
                        self.ctrl.finished.store(true, Ordering::Relaxed);
                    }
                    break;
                }
            }
        }

        let vol = load_f32(&self.ctrl.volume).max(0.0);
        let pan = load_f32(&self.ctrl.pan).clamp(-1.0, 1.0);
        Frame::new(l * vol * (1.0 - pan.max(0.0)), r * vol * (1.0 + pan.min(0.0)))
    }
}

impl KiraSound for StretchSound {
    fn output_destination(&mut self) -> OutputDestination {
        OutputDestination::default()
    }

    fn process(
        &mut self,
        dt: f64,
        _clock_info_provider: &ClockInfoProvider,
        _modulator_value_provider: &ModulatorValueProvider,
    ) -> Frame {
        self.next_frame(dt)
    }

    fn finished(&self) -> bool {
        self.ctrl.finished.load(Ordering::Relaxed)
    }
}

impl Drop for StretchSound {
    fn drop(&mut self) {
        // kira unloaded the sound; the feeder must not outlive it
        self.ring.quit.store(true, Ordering::Relaxed);
    }
}

struct StretchSoundData {
    ring: Arc<StreamRing>,
    ctrl: Arc<StretchCtrl>,
    src_rate: u32,
}

impl KiraSoundData for StretchSoundData {
    type Error = Infallible;
    type Handle = StretchHandle;

    fn into_sound(self) -> Result<(Box<dyn KiraSound>, Self::Handle), Self::Error> {
        let handle = StretchHandle {
            ring: Arc::clone(&self.ring),
            ctrl: Arc::clone(&self.ctrl),
        };
        let sound = Box::new(StretchSound {
            ring: self.ring,
            ctrl: self.ctrl,
            src_rate: self.src_rate,
            frac: 0.0,
            cur: [0.0; 2],
            nxt: [0.0; 2],
            primed: false,
        });
        Ok((sound, handle))
    }
}

enum TempoHandle {
    Sample(StaticSoundHandle),
    Stretch(StretchHandle),
}

impl TempoHandle {
    fn state(&self) -> PlaybackState {
        match self {
            Self::Sample(h) => h.state(),
            Self::Stretch(h) => h.state(),
        }
    }

    fn position(&self) -> f64 {
        match self {
            Self::Sample(h) => h.position(),
            Self::Stretch(h) => h.ring.audible_ms() / 1000.0,
        }
    }

    fn pause(&mut self, tween: Tween) {
        match self {
            Self::Sample(h) => h.pause(tween),
            Self::Stretch(h) => h.ctrl.playing.store(false, Ordering::Relaxed),
        }
    }

    fn resume(&mut self, tween: Tween) {
        match self {
            Self::Sample(h) => h.resume(tween),
            Self::Stretch(h) => h.ctrl.playing.store(true, Ordering::Relaxed),
        }
    }

    fn stop(&mut self, tween: Tween) {
        match self {
            Self::Sample(h) => h.stop(tween),
            Self::Stretch(h) => h.stop(),
        }
    }

    fn set_volume(&mut self, volume: f64, tween: Tween) {
        match self {
            Self::Sample(h) => h.set_volume(volume, tween),
            Self::Stretch(h) => store_f32(&h.ctrl.volume, volume as f32),
        }
    }

    fn set_pan(&mut self, pan: f32, tween: Tween) {
        match self {
            Self::Sample(h) => h.set_panning(pan_to_kira(pan), tween),
            Self::Stretch(h) => store_f32(&h.ctrl.pan, pan.clamp(-1.0, 1.0)),
        }
    }

    fn set_rate(&mut self, speed: f32, pitch: f32, freq_ratio: f32, mode: SpeedMode) {
        match self {
            Self::Sample(h) => {
                h.set_playback_rate(effective_rate(speed, pitch, freq_ratio), instant());
            }
            Self::Stretch(h) => {
                let (stretch, resample) = stretch_rates(speed, pitch, freq_ratio, mode);
                h.ring
                    .stretch_speed
                    .store(stretch.max(0.05).to_bits(), Ordering::Relaxed);
                store_f32(&h.ctrl.resample, resample.max(0.0));
            }
        }
    }

    fn set_loop_region(&mut self, looped: bool) {
        match self {
            Self::Sample(h) => {
                if looped {
                    h.set_loop_region(..);
                } else {
                    h.set_loop_region(None);
                }
            }
            Self::Stretch(h) => h.ring.looped.store(looped, Ordering::Relaxed),
        }
    }

    fn seek_to_ms(&mut self, target_ms: f64, accurate: bool) {
        match self {
            Self::Sample(h) => h.seek_to(target_ms.max(0.0) / 1000.0),
            Self::Stretch(h) => h.request_seek(target_ms.max(0.0), accurate),
        }
    }
}

struct TempoVoiceInner {
    id: u64,
    handle: TempoHandle,
    /// Volume before the master multiply.
    base_volume: f32,
    protected: bool,
}

/// The tempo backend.
pub struct TempoMixer {
    manager: Option<AudioManager>,
    /// Shared with every voice so volume changes use the live master value.
    master_volume: Arc<AtomicU32>,
    voice_ceiling: u32,
    /// Live voices, shared with their [`TempoVoice`] handles for master
    /// volume fan-out and stealing.
    live: Vec<Arc<Mutex<TempoVoiceInner>>>,
    next_voice_id: u64,
}

impl Default for TempoMixer {
    fn default() -> Self {
        Self::new()
    }
}

impl TempoMixer {
    pub fn new() -> Self {
        Self {
            manager: None,
            master_volume: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            voice_ceiling: crate::config::MIN_VOICE_CEILING,
            live: Vec::new(),
            next_voice_id: 0,
        }
    }

    fn prune(&mut self) {
        self.live.retain(|v| {
            v.lock()
                .map(|inner| inner.handle.state() != PlaybackState::Stopped)
                .unwrap_or(false)
        });
    }

    fn steal_if_needed(&mut self) -> Result<()> {
        self.prune();
        if (self.live.len() as u32) < self.voice_ceiling {
            return Ok(());
        }
        let victim = self
            .live
            .iter()
            .enumerate()
            .filter(|(_, v)| v.lock().map(|i| !i.protected).unwrap_or(false))
            .min_by_key(|(_, v)| v.lock().map(|i| i.id).unwrap_or(u64::MAX))
            .map(|(i, _)| i);
        match victim {
            Some(i) => {
                let voice = self.live.remove(i);
                if let Ok(mut inner) = voice.lock() {
                    debug!("voice ceiling reached, stole voice {}", inner.id);
                    inner.handle.stop(instant());
                }
                Ok(())
            }
            None => bail!("voice ceiling reached and every voice is protected"),
        }
    }
}

impl Mixer for TempoMixer {
    type Source = TempoSource;
    type Voice = TempoVoice;

    const DRIVER: crate::engine::device::DriverKind = crate::engine::device::DriverKind::Tempo;

    fn init(&mut self, device: &OutputDevice, config: &AudioConfig) -> Result<()> {
        self.shutdown();

        // kira opens the system default output; an explicit device choice is
        // honored to the extent the host routes the default there
        self.voice_ceiling = config.clamped_voice_ceiling();
        self.master_volume
            .store(config.master_volume.to_bits(), Ordering::Relaxed);

        let settings = AudioManagerSettings::<DefaultBackend> {
            capacities: Capacities {
                sound_capacity: self.voice_ceiling as u16,
                ..Default::default()
            },
            ..Default::default()
        };
        let manager = AudioManager::<DefaultBackend>::new(settings)
            .map_err(|e| anyhow!("failed to create audio manager: {e}"))?;
        info!(device = %device.name, voices = self.voice_ceiling, "tempo mixer online");
        self.manager = Some(manager);
        Ok(())
    }

    fn shutdown(&mut self) {
        for voice in self.live.drain(..) {
            if let Ok(mut inner) = voice.lock() {
                inner.handle.stop(instant());
            }
        }
        self.manager = None;
    }

    fn is_ready(&self) -> bool {
        self.manager.is_some()
    }

    fn set_master_volume(&mut self, volume: f32) {
        self.master_volume.store(volume.to_bits(), Ordering::Relaxed);
        for voice in &self.live {
            if let Ok(mut inner) = voice.lock() {
                let applied = (inner.base_volume * volume) as f64;
                inner.handle.set_volume(applied, instant());
            }
        }
    }

    fn set_voice_ceiling(&mut self, ceiling: u32) {
        self.voice_ceiling = ceiling;
    }

    fn active_voice_count(&self) -> usize {
        self.live
            .iter()
            .filter(|v| {
                v.lock()
                    .map(|i| i.handle.state() != PlaybackState::Stopped)
                    .unwrap_or(false)
            })
            .count()
    }

    fn open_source(
        path: &Path,
        desc: &SoundDesc,
        _config: &AudioConfig,
    ) -> Result<OpenedSource<TempoSource>> {
        // symphonia probe for length and rate; it also feeds stream voices
        let info = StreamDecoder::probe_info(path)?;
        let source = if desc.stream {
            TempoSource::Stream {
                path: path.to_path_buf(),
                info,
            }
        } else {
            let data = StaticSoundData::from_file(path)
                .map_err(|e| anyhow!("kira failed to load {}: {e}", path.display()))?;
            TempoSource::Sample(data)
        };
        Ok(OpenedSource {
            source,
            length_ms: info.length_ms,
            base_sample_rate: info.sample_rate,
        })
    }

    fn play(&mut self, source: &mut TempoSource, params: &PlayParams) -> Result<TempoVoice> {
        let master = load_f32(&self.master_volume);
        self.steal_if_needed()?;
        let manager = self
            .manager
            .as_mut()
            .ok_or_else(|| anyhow!("tempo mixer is not running"))?;

        let volume = (params.volume * master) as f64;
        let start = params.start_ms.max(0.0) / 1000.0;

        let mut handle = match source {
            TempoSource::Sample(data) => {
                let mut data = data
                    .clone()
                    .volume(volume)
                    .panning(pan_to_kira(params.pan))
                    .playback_rate(effective_rate(params.speed, params.pitch, 1.0))
                    .start_position(start);
                if params.looped {
                    data = data.loop_region(..);
                }
                TempoHandle::Sample(
                    manager
                        .play(data)
                        .map_err(|e| anyhow!("sample play failed: {e}"))?,
                )
            }
            TempoSource::Stream { path, info } => {
                let mut dec = StreamDecoder::open(path)?;
                if params.start_ms > 0.0 {
                    dec.decode_to_ms(params.start_ms)?;
                }
                let ring = Arc::new(StreamRing::new(*info, params));
                store_f64(&ring.base_ms, dec.decoded_ms());
                let ctrl = Arc::new(StretchCtrl::new(params, master));
                let (stretch, resample) =
                    stretch_rates(params.speed, params.pitch, 1.0, params.speed_mode);
                ring.stretch_speed
                    .store(stretch.max(0.05).to_bits(), Ordering::Relaxed);
                store_f32(&ctrl.resample, resample);

                let feeder_ring = Arc::clone(&ring);
                std::thread::Builder::new()
                    .name("kumi-audio-feeder".to_string())
                    .spawn(move || feeder_loop(dec, feeder_ring))
                    .context("failed to spawn feeder thread")?;

                let data = StretchSoundData {
                    ring: Arc::clone(&ring),
                    ctrl,
                    src_rate: info.sample_rate,
                };
                match manager.play(data) {
                    Ok(h) => TempoHandle::Stretch(h),
                    Err(e) => {
                        ring.quit.store(true, Ordering::Relaxed);
                        bail!("stream play failed: {e}");
                    }
                }
            }
        };
        if params.paused {
            handle.pause(instant());
        }

        self.next_voice_id += 1;
        let inner = Arc::new(Mutex::new(TempoVoiceInner {
            id: self.next_voice_id,
            handle,
            base_volume: params.volume,
            protected: params.protected,
        }));
        self.live.push(Arc::clone(&inner));
        Ok(TempoVoice {
            inner,
            master_volume: Arc::clone(&self.master_volume),
            speed: params.speed,
            pitch: params.pitch,
            freq_ratio: 1.0,
            mode: params.speed_mode,
        })
    }
}

/// Voice handle returned by [`TempoMixer::play`].
pub struct TempoVoice {
    inner: Arc<Mutex<TempoVoiceInner>>,
    master_volume: Arc<AtomicU32>,
    speed: f32,
    pitch: f32,
    freq_ratio: f32,
    mode: SpeedMode,
}

impl TempoVoice {
    fn with_live_handle(&mut self, f: impl FnOnce(&mut TempoHandle)) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.handle.state() != PlaybackState::Stopped {
                f(&mut inner.handle);
            }
        }
    }

    fn apply_rate(&mut self) {
        let (speed, pitch, freq_ratio, mode) = (self.speed, self.pitch, self.freq_ratio, self.mode);
        self.with_live_handle(|h| h.set_rate(speed, pitch, freq_ratio, mode));
    }
}

impl Voice for TempoVoice {
    fn is_valid(&self) -> bool {
        self.inner
            .lock()
            .map(|i| i.handle.state() != PlaybackState::Stopped)
            .unwrap_or(false)
    }

    fn is_playing(&self) -> bool {
        self.inner
            .lock()
            .map(|i| i.handle.state() == PlaybackState::Playing)
            .unwrap_or(false)
    }

    fn raw_position_ms(&self) -> f64 {
        self.inner
            .lock()
            .map(|i| i.handle.position() * 1000.0)
            .unwrap_or(0.0)
    }

    fn pause(&mut self) {
        self.with_live_handle(|h| h.pause(Tween::default()));
    }

    fn resume(&mut self) {
        self.with_live_handle(|h| h.resume(Tween::default()));
    }

    fn stop(&mut self) {
        self.with_live_handle(|h| h.stop(Tween::default()));
    }

    fn set_volume(&mut self, volume: f32) {
        let master = load_f32(&self.master_volume);
        if let Ok(mut inner) = self.inner.lock() {
            inner.base_volume = volume;
            if inner.handle.state() != PlaybackState::Stopped {
                let applied = (volume * master) as f64;
                inner.handle.set_volume(applied, instant());
            }
        }
    }

    fn set_pan(&mut self, pan: f32) {
        self.with_live_handle(|h| h.set_pan(pan, instant()));
    }

    fn set_speed(&mut self, speed: f32, mode: SpeedMode) {
        self.speed = speed;
        self.mode = mode;
        self.apply_rate();
    }

    fn set_pitch(&mut self, pitch: f32) {
        self.pitch = pitch;
        self.apply_rate();
    }

    fn set_frequency_ratio(&mut self, ratio: f32) {
        self.freq_ratio = ratio;
        self.apply_rate();
    }

    fn set_looped(&mut self, looped: bool) {
        self.with_live_handle(|h| h.set_loop_region(looped));
    }

    fn seek_forward_ms(&mut self, target_ms: f64) -> Result<()> {
        if !self.is_valid() {
            bail!("voice is no longer live");
        }
        self.with_live_handle(|h| h.seek_to_ms(target_ms, true));
        Ok(())
    }

    fn seek_fast_ms(&mut self, target_ms: f64) -> Result<()> {
        if !self.is_valid() {
            bail!("voice is no longer live");
        }
        self.with_live_handle(|h| h.seek_to_ms(target_ms, false));
        Ok(())
    }
}
