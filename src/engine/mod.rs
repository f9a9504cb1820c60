//! Engine facade: device lifecycle, global controls, playback dispatch.
//!
//! The engine owns the active mixer and the background loader and is the
//! single entry point the host drives once per frame. It is main-thread
//! only; sounds borrow the mixer through the engine for every operation
//! that can start or rebuild a voice.

pub mod device;

use std::path::PathBuf;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::backend::mix::StreamMixer;
use crate::backend::tempo::TempoMixer;
use crate::backend::{Mixer, SoundDesc};
use crate::config::AudioConfig;
use crate::loader::Loader;
use crate::sound::Sound;

use device::{DriverKind, OutputDevice};

/// Output context lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No output context yet; everything is a safe no-op.
    Uninitialized,
    /// Output context up, playback possible. Also the state of the
    /// deliberate "No sound" selection, where playback silently no-ops.
    Ready,
    /// Every init attempt failed; behaves like "No sound" until the next
    /// explicit device change.
    Unavailable,
}

/// Where a device-change notification sits relative to the rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPhase {
    /// Old context still up; release device-bound resources now.
    Before,
    /// New context up; reacquire.
    After,
}

type RestartCallback = Box<dyn FnMut(RestartPhase)>;
type CeilingCallback = Box<dyn FnMut(u32)>;

/// The audio engine. Generic over the mixer so the whole engine/sound layer
/// compiles once per backend with no dynamic dispatch.
pub struct SoundEngine<M: Mixer + 'static> {
    mixer: M,
    state: EngineState,
    config: AudioConfig,
    devices: Vec<OutputDevice>,
    current_device: OutputDevice,
    loader: Loader<M>,
    /// Host frame time in seconds; timestamp source for the interpolator
    /// and the per-frame play rate limit.
    frame_time: f64,
    restart_callbacks: Vec<RestartCallback>,
    ceiling_callbacks: Vec<CeilingCallback>,
}

impl<M: Mixer + 'static> SoundEngine<M> {
    pub fn new(mixer: M, config: AudioConfig) -> Self {
        Self {
            mixer,
            state: EngineState::Uninitialized,
            config,
            devices: Vec::new(),
            current_device: OutputDevice::default_sentinel(M::DRIVER),
            loader: Loader::new(),
            frame_time: 0.0,
            restart_callbacks: Vec::new(),
            ceiling_callbacks: Vec::new(),
        }
    }

    /// Advance the engine clock. Call once per host frame, before any
    /// `play`/`position` calls of that frame.
    pub fn update(&mut self, now: f64) {
        self.frame_time = now;
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == EngineState::Ready
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn output_devices(&self) -> &[OutputDevice] {
        &self.devices
    }

    pub fn current_device(&self) -> &OutputDevice {
        &self.current_device
    }

    /// The catalogue's default output, if enumeration found one. The
    /// synthetic "Default" sentinel qualifies, so after
    /// [`SoundEngine::update_output_devices`] this only returns `None` on an
    /// empty catalogue.
    pub fn default_device(&self) -> Option<&OutputDevice> {
        self.devices.iter().find(|d| d.enabled && d.is_default)
    }

    /// The device the persisted preference currently resolves to, before
    /// any init attempt. May differ from [`SoundEngine::current_device`]
    /// after a rollback.
    pub fn wanted_device(&self) -> Option<&OutputDevice> {
        device::resolve_wanted(&self.devices, &self.config.output_device)
    }

    pub fn active_voice_count(&self) -> usize {
        self.mixer.active_voice_count()
    }

    /// Re-enumerate the output catalogue. The synthetic default entry is
    /// always present, so the result is never empty.
    pub fn update_output_devices(&mut self) {
        self.devices = device::enumerate(M::DRIVER);
    }

    /// Enumerate, resolve the persisted device preference, and bring the
    /// output context up on it.
    pub fn initialize(&mut self) -> bool {
        self.update_output_devices();
        let wanted = self.config.output_device.clone();
        let chosen = device::resolve_wanted(&self.devices, &wanted)
            .cloned()
            .unwrap_or_else(|| OutputDevice::default_sentinel(M::DRIVER));
        self.initialize_output_device(chosen)
    }

    /// Bring the output context up on a specific device. On failure, rolls
    /// back to the previously working device; if that fails too the engine
    /// goes [`EngineState::Unavailable`] and playback becomes a silent
    /// no-op. Blocks the caller for the duration of the rebuild.
    pub fn initialize_output_device(&mut self, chosen: OutputDevice) -> bool {
        if chosen.is_no_sound() {
            self.mixer.shutdown();
            self.current_device = chosen;
            self.state = EngineState::Ready;
            info!("audio output disabled by choice");
            return true;
        }

        let previous = self.current_device.clone();
        let was_ready = self.state == EngineState::Ready && !previous.is_no_sound();

        match self.mixer.init(&chosen, &self.config) {
            Ok(()) => {
                info!(device = %chosen.name, "audio output ready");
                self.current_device = chosen;
                self.state = EngineState::Ready;
                return true;
            }
            Err(e) => {
                warn!(device = %chosen.name, "audio output init failed: {e:#}");
            }
        }

        if was_ready && previous.name != chosen.name {
            match self.mixer.init(&previous, &self.config) {
                Ok(()) => {
                    warn!(device = %previous.name, "rolled back to previous audio device");
                    self.current_device = previous;
                    self.state = EngineState::Ready;
                    return false;
                }
                Err(e) => {
                    warn!(device = %previous.name, "rollback init failed: {e:#}");
                }
            }
        }

        self.mixer.shutdown();
        self.current_device = OutputDevice::no_sound();
        self.state = EngineState::Unavailable;
        false
    }

    /// Switch the output device by catalogue name. A no-op when the name
    /// already matches the active device.
    pub fn set_output_device(&mut self, name: &str) -> bool {
        if name == self.current_device.name {
            debug!(device = name, "output device unchanged");
            return true;
        }
        let chosen = if name == OutputDevice::no_sound().name {
            Some(OutputDevice::no_sound())
        } else {
            device::resolve_wanted(&self.devices, name).cloned()
        };
        let Some(chosen) = chosen else {
            warn!(device = name, "unknown output device");
            return false;
        };
        self.config.output_device = chosen.name.clone();
        self.rebuild_on(chosen)
    }

    /// Tear down and rebuild the output context on the current device.
    /// Master volume and all other settings carry over.
    pub fn restart(&mut self) -> bool {
        self.rebuild_on(self.current_device.clone())
    }

    fn rebuild_on(&mut self, chosen: OutputDevice) -> bool {
        for cb in &mut self.restart_callbacks {
            cb(RestartPhase::Before);
        }
        let ok = self.initialize_output_device(chosen);
        for cb in &mut self.restart_callbacks {
            cb(RestartPhase::After);
        }
        ok
    }

    /// Register for device-change notifications, fired around every
    /// rebuild. Sounds that hold device-bound state re-load in response.
    pub fn on_restart(&mut self, cb: impl FnMut(RestartPhase) + 'static) {
        self.restart_callbacks.push(Box::new(cb));
    }

    /// Register for voice-ceiling changes; receives the clamped value.
    pub fn on_voice_ceiling_changed(&mut self, cb: impl FnMut(u32) + 'static) {
        self.ceiling_callbacks.push(Box::new(cb));
    }

    pub fn master_volume(&self) -> f32 {
        self.config.master_volume
    }

    pub fn set_master_volume(&mut self, volume: f32) {
        self.config.master_volume = volume.clamp(0.0, 1.0);
        self.mixer.set_master_volume(self.config.master_volume);
    }

    /// Change the simultaneous-voice ceiling. The stored preference keeps
    /// the raw value; the mixer and the callbacks get the clamped one.
    pub fn set_max_voices(&mut self, max: u32) {
        self.config.max_simultaneous_voices = max;
        let clamped = self.config.clamped_voice_ceiling();
        self.mixer.set_voice_ceiling(clamped);
        for cb in &mut self.ceiling_callbacks {
            cb(clamped);
        }
    }

    /// Create a sound and queue its background load. The sound becomes
    /// ready (or ignored) on a later frame; poll with [`Sound::update`].
    pub fn create_sound(
        &mut self,
        path: PathBuf,
        stream: bool,
        overlayable: bool,
        looped: bool,
    ) -> Sound<M> {
        let desc = SoundDesc {
            path: path.clone(),
            stream,
            overlayable,
            looped,
        };
        let slot = self.loader.enqueue(path, desc.clone(), self.config.clone());
        Sound::new(desc, slot, &self.config)
    }

    /// Re-load a sound from scratch, optionally under a new path. Used when
    /// a device rebuild invalidated its backend source.
    pub fn rebuild_sound(&mut self, sound: &mut Sound<M>, new_path: PathBuf) {
        sound.reset_for_rebuild(new_path.clone());
        let slot = self
            .loader
            .enqueue(new_path, sound.desc().clone(), self.config.clone());
        sound.set_pending(slot);
    }

    /// Start (or resume) playback. Returns whether a voice is now playing
    /// because of this call.
    ///
    /// `pan` and `pitch` re-arm every fresh play of a stream; a sample
    /// ignores `pitch` (pitch is a stream control). Overlayable samples are
    /// rate-limited to one spawn per engine frame.
    pub fn play(&mut self, sound: &mut Sound<M>, pan: f32, pitch: f32) -> bool {
        if self.state != EngineState::Ready || !self.mixer.is_ready() {
            return false;
        }
        sound.update();
        if !sound.is_ready() {
            return false;
        }

        if sound.is_overlayable() && sound.last_play_time == self.frame_time {
            // one spawn per frame; layered retriggers inside a frame are
            // always mixing artifacts, not intent
            return false;
        }

        sound.set_pan(pan);
        if sound.is_stream() {
            sound.set_pitch(pitch);
        }

        if sound.take_resume_scheduled() {
            sound.resume_voices();
            sound.last_play_time = self.frame_time;
            return true;
        }

        if !sound.is_overlayable() {
            sound.prune_voices();
            if sound.has_valid_voice() {
                if sound.is_playing() {
                    return false;
                }
                sound.resume_voices();
                sound.last_play_time = self.frame_time;
                return true;
            }
        }

        match sound.start(&mut self.mixer, 0.0, self.frame_time) {
            Ok(()) => {
                sound.last_play_time = self.frame_time;
                true
            }
            Err(e) => {
                warn!(path = %sound.path().display(), "play failed: {e:#}");
                false
            }
        }
    }

    pub fn pause(&mut self, sound: &mut Sound<M>) {
        sound.pause(self.frame_time);
    }

    pub fn stop(&mut self, sound: &mut Sound<M>) {
        sound.stop();
    }

    /// Smoothed playback position of a sound at the current frame time.
    pub fn position_ms(&self, sound: &mut Sound<M>) -> u32 {
        sound.position_ms(self.frame_time)
    }

    pub fn seek_ms(&mut self, sound: &mut Sound<M>, target_ms: f64) -> Result<()> {
        sound.set_position_ms(&mut self.mixer, target_ms, self.frame_time)
    }

    pub fn seek_ms_fast(&mut self, sound: &mut Sound<M>, target_ms: f64) -> Result<()> {
        sound.set_position_ms_fast(target_ms, self.frame_time)
    }

    /// Seek to a fraction of the sound's length.
    pub fn seek(&mut self, sound: &mut Sound<M>, percent: f32) -> Result<()> {
        sound.set_position(&mut self.mixer, percent, self.frame_time)
    }

    pub fn shutdown(&mut self) {
        self.mixer.shutdown();
        self.state = EngineState::Uninitialized;
    }
}

/// Which native mixer drives the engine. Fixed at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// kira, hardware-style rate control.
    Tempo,
    /// Software mix bus with the time-stretch filter.
    Mix,
}

/// Engine instantiated for one of the two production backends.
pub enum AnyEngine {
    Tempo(SoundEngine<TempoMixer>),
    Mix(SoundEngine<StreamMixer>),
}

impl AnyEngine {
    pub fn new(backend: Backend, config: AudioConfig) -> Self {
        match backend {
            Backend::Tempo => Self::Tempo(SoundEngine::new(TempoMixer::new(), config)),
            Backend::Mix => Self::Mix(SoundEngine::new(StreamMixer::new(), config)),
        }
    }

    pub fn initialize(&mut self) -> bool {
        match self {
            Self::Tempo(e) => e.initialize(),
            Self::Mix(e) => e.initialize(),
        }
    }

    pub fn state(&self) -> EngineState {
        match self {
            Self::Tempo(e) => e.state(),
            Self::Mix(e) => e.state(),
        }
    }

    pub fn update(&mut self, now: f64) {
        match self {
            Self::Tempo(e) => e.update(now),
            Self::Mix(e) => e.update(now),
        }
    }

    pub fn set_master_volume(&mut self, volume: f32) {
        match self {
            Self::Tempo(e) => e.set_master_volume(volume),
            Self::Mix(e) => e.set_master_volume(volume),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockMixer;
    use crate::config::{MAX_VOICE_CEILING, MIN_VOICE_CEILING};
    use std::fs::File;
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn engine() -> SoundEngine<MockMixer> {
        SoundEngine::new(MockMixer::new(), AudioConfig::default())
    }

    fn mix_device(name: &str) -> OutputDevice {
        OutputDevice {
            id: 0,
            name: name.to_string(),
            is_default: false,
            enabled: true,
            driver: DriverKind::Mix,
        }
    }

    fn write_wav(path: &std::path::Path) {
        let mut data = b"RIFF\x24\x00\x00\x00WAVEfmt ".to_vec();
        data.resize(256, 0);
        File::create(path).unwrap().write_all(&data).unwrap();
    }

    /// Create a sound and poll it until the background load settles.
    fn ready_sound(
        engine: &mut SoundEngine<MockMixer>,
        path: PathBuf,
        stream: bool,
        overlayable: bool,
    ) -> Sound<MockMixer> {
        let mut sound = engine.create_sound(path, stream, overlayable, false);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !sound.is_ready() && !sound.is_ignored() {
            assert!(Instant::now() < deadline, "load never settled");
            std::thread::sleep(Duration::from_millis(1));
            sound.update();
        }
        assert!(sound.is_ready());
        sound
    }

    #[test]
    fn init_makes_engine_ready() {
        let mut engine = engine();
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert!(engine.initialize_output_device(mix_device("Speakers")));
        assert_eq!(engine.state(), EngineState::Ready);
        assert_eq!(engine.current_device().name, "Speakers");
    }

    #[test]
    fn no_sound_selection_is_trivially_ready() {
        let mut engine = engine();
        assert!(engine.initialize_output_device(OutputDevice::no_sound()));
        assert_eq!(engine.state(), EngineState::Ready);
        assert!(engine.current_device().is_no_sound());
        // mixer never came up, so playback is a silent no-op
        assert!(!engine.mixer.is_ready());
    }

    #[test]
    fn failed_init_rolls_back_to_previous_device() {
        // switching to a broken device must not kill audio
        let mut engine = engine();
        assert!(engine.initialize_output_device(mix_device("Speakers")));

        engine.mixer.fail_inits = 1;
        assert!(!engine.initialize_output_device(mix_device("Broken HDMI")));
        assert_eq!(engine.state(), EngineState::Ready);
        assert_eq!(engine.current_device().name, "Speakers");
    }

    #[test]
    fn exhausted_rollback_goes_unavailable_with_safe_noops() {
        let mut engine = engine();
        assert!(engine.initialize_output_device(mix_device("Speakers")));

        // new device fails, and so does the rollback
        engine.mixer.fail_inits = 2;
        assert!(!engine.initialize_output_device(mix_device("Broken HDMI")));
        assert_eq!(engine.state(), EngineState::Unavailable);
        assert!(engine.current_device().is_no_sound());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.wav");
        write_wav(&path);
        let mut sound = ready_sound(&mut engine, path, true, false);
        assert!(!engine.play(&mut sound, 0.0, 1.0));
    }

    #[test]
    fn restart_preserves_master_volume() {
        let mut engine = engine();
        assert!(engine.initialize_output_device(mix_device("Speakers")));
        engine.set_master_volume(0.4);
        assert!(engine.restart());
        assert_eq!(engine.mixer.init_count, 2);
        assert!((engine.mixer.master_volume - 0.4).abs() < 1e-6);
    }

    #[test]
    fn master_volume_clamped_to_unit_range() {
        let mut engine = engine();
        engine.set_master_volume(3.0);
        assert_eq!(engine.master_volume(), 1.0);
        engine.set_master_volume(-1.0);
        assert_eq!(engine.master_volume(), 0.0);
    }

    #[test]
    fn voice_ceiling_clamped_and_notified() {
        let mut engine = engine();
        assert!(engine.initialize_output_device(mix_device("Speakers")));
        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = Arc::clone(&seen);
        engine.on_voice_ceiling_changed(move |c| seen2.store(c, Ordering::SeqCst));

        engine.set_max_voices(10_000);
        assert_eq!(engine.mixer.voice_ceiling, MAX_VOICE_CEILING);
        assert_eq!(seen.load(Ordering::SeqCst), MAX_VOICE_CEILING);

        engine.set_max_voices(1);
        assert_eq!(engine.mixer.voice_ceiling, MIN_VOICE_CEILING);
    }

    #[test]
    fn restart_callbacks_fire_in_order() {
        let mut engine = engine();
        assert!(engine.initialize_output_device(mix_device("Speakers")));
        let phases = Arc::new(AtomicUsize::new(0));
        let p = Arc::clone(&phases);
        engine.on_restart(move |phase| {
            let n = p.fetch_add(1, Ordering::SeqCst);
            match n {
                0 => assert_eq!(phase, RestartPhase::Before),
                1 => assert_eq!(phase, RestartPhase::After),
                _ => panic!("callback fired too often"),
            }
        });
        engine.restart();
        assert_eq!(phases.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn play_requires_a_ready_sound() {
        let mut engine = engine();
        assert!(engine.initialize_output_device(mix_device("Speakers")));
        let mut sound = engine.create_sound(PathBuf::from("/missing.wav"), true, false, false);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !sound.is_ignored() {
            assert!(Instant::now() < deadline, "load never settled");
            std::thread::sleep(Duration::from_millis(1));
            sound.update();
        }
        assert!(!engine.play(&mut sound, 0.0, 1.0));
    }

    #[test]
    fn play_applies_sticky_pan_and_pitch_to_streams() {
        let mut engine = engine();
        assert!(engine.initialize_output_device(mix_device("Speakers")));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.wav");
        write_wav(&path);
        let mut sound = ready_sound(&mut engine, path, true, false);

        sound.set_pan(0.7);
        sound.set_pitch(1.3);
        assert!(engine.play(&mut sound, 0.0, 1.0));
        // a fresh play re-arms the transport, it does not inherit leftovers
        assert_eq!(sound.pan(), 0.0);
        assert_eq!(sound.pitch(), 1.0);
    }

    #[test]
    fn overlayable_sample_rate_limited_per_frame() {
        let mut engine = engine();
        assert!(engine.initialize_output_device(mix_device("Speakers")));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hit.wav");
        write_wav(&path);
        let mut sound = ready_sound(&mut engine, path, false, true);

        engine.update(1.0);
        assert!(engine.play(&mut sound, 0.0, 1.0));
        assert!(!engine.play(&mut sound, 0.0, 1.0), "same frame retrigger");
        engine.update(1.016);
        assert!(engine.play(&mut sound, 0.0, 1.0));
        assert_eq!(engine.mixer.played.len(), 2);
    }

    #[test]
    fn play_on_playing_single_instance_is_a_noop() {
        let mut engine = engine();
        assert!(engine.initialize_output_device(mix_device("Speakers")));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.wav");
        write_wav(&path);
        let mut sound = ready_sound(&mut engine, path, true, false);

        engine.update(1.0);
        assert!(engine.play(&mut sound, 0.0, 1.0));
        engine.update(2.0);
        assert!(!engine.play(&mut sound, 0.0, 1.0));
        assert_eq!(engine.mixer.played.len(), 1);
    }

    #[test]
    fn play_resumes_a_paused_single_instance() {
        let mut engine = engine();
        assert!(engine.initialize_output_device(mix_device("Speakers")));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.wav");
        write_wav(&path);
        let mut sound = ready_sound(&mut engine, path, true, false);

        engine.update(1.0);
        assert!(engine.play(&mut sound, 0.0, 1.0));
        engine.pause(&mut sound);
        assert!(!sound.is_playing());

        engine.update(2.0);
        assert!(engine.play(&mut sound, 0.0, 1.0));
        assert!(sound.is_playing());
        assert_eq!(engine.mixer.played.len(), 1, "resume must not respawn");
    }

    #[test]
    fn play_completes_a_scheduled_resume_after_backward_seek() {
        let mut engine = engine();
        assert!(engine.initialize_output_device(mix_device("Speakers")));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.wav");
        write_wav(&path);
        let mut sound = ready_sound(&mut engine, path, true, false);

        engine.update(1.0);
        assert!(engine.play(&mut sound, 0.0, 1.0));
        engine.mixer.last_voice().lock().unwrap().raw_position_ms = 5000.0;

        engine.update(2.0);
        engine.seek_ms(&mut sound, 1000.0).unwrap();
        assert!(sound.resume_scheduled());
        let parked = engine.mixer.last_voice();
        assert!(!parked.lock().unwrap().playing);

        assert!(engine.play(&mut sound, 0.0, 1.0));
        assert!(parked.lock().unwrap().playing);
        assert!(!sound.resume_scheduled());
    }

    #[test]
    fn rebuild_sound_requeues_the_load() {
        let mut engine = engine();
        assert!(engine.initialize_output_device(mix_device("Speakers")));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.wav");
        write_wav(&path);
        let mut sound = ready_sound(&mut engine, path, true, false);

        let other = dir.path().join("other.wav");
        write_wav(&other);
        engine.rebuild_sound(&mut sound, other.clone());
        assert!(!sound.is_ready());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !sound.is_ready() && !sound.is_ignored() {
            assert!(Instant::now() < deadline, "reload never settled");
            std::thread::sleep(Duration::from_millis(1));
            sound.update();
        }
        assert!(sound.is_ready());
        assert_eq!(sound.path(), other.as_path());
    }

    #[test]
    fn stale_voices_are_safe_after_restart() {
        let mut engine = engine();
        assert!(engine.initialize_output_device(mix_device("Speakers")));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.wav");
        write_wav(&path);
        let mut sound = ready_sound(&mut engine, path, true, false);

        engine.update(1.0);
        assert!(engine.play(&mut sound, 0.0, 1.0));
        let voice = engine.mixer.last_voice();
        engine.restart();

        // restart invalidated the voice; the handle must read as stopped
        assert!(!voice.lock().unwrap().valid);
        assert!(!sound.is_playing());
        assert_eq!(engine.position_ms(&mut sound), 0);
    }

    #[test]
    fn default_and_wanted_device_resolve_against_the_catalogue() {
        let mut engine = engine();
        engine.devices = vec![
            OutputDevice::default_sentinel(DriverKind::Mix),
            mix_device("Speakers (Realtek)"),
            mix_device("HDMI Output"),
        ];

        assert_eq!(engine.default_device().unwrap().name, "Default");

        // empty preference falls back to the default entry
        assert_eq!(engine.wanted_device().unwrap().name, "Default");

        engine.config.output_device = "realtek".to_string();
        assert_eq!(engine.wanted_device().unwrap().name, "Speakers (Realtek)");

        engine.config.output_device = "Bluetooth Earbuds".to_string();
        assert!(engine.wanted_device().unwrap().is_default);
    }

    #[test]
    fn set_output_device_same_name_is_a_noop() {
        let mut engine = engine();
        assert!(engine.initialize_output_device(mix_device("Speakers")));
        assert!(engine.set_output_device("Speakers"));
        assert_eq!(engine.mixer.init_count, 1, "no rebuild on unchanged name");
    }
}
