//! Scripted in-memory mixer for tests. No audio hardware, no decoding;
//! tests drive raw positions and validity by hand through the shared
//! [`MockVoiceState`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};

use crate::config::AudioConfig;
use crate::engine::device::OutputDevice;

use super::{Mixer, OpenedSource, PlayParams, SoundDesc, SpeedMode, Voice};

/// Length reported for every mock source.
pub const MOCK_LENGTH_MS: u64 = 10_000;
pub const MOCK_SAMPLE_RATE: u32 = 44_100;

pub struct MockSource {
    pub path: PathBuf,
    pub desc: SoundDesc,
}

#[derive(Debug)]
pub struct MockVoiceState {
    pub id: u64,
    pub valid: bool,
    pub playing: bool,
    pub raw_position_ms: f64,
    pub volume: f32,
    pub pan: f32,
    pub speed: f32,
    pub mode: SpeedMode,
    pub pitch: f32,
    pub freq_ratio: f32,
    pub looped: bool,
    pub protected: bool,
    pub forward_seeks: Vec<f64>,
    pub fast_seeks: Vec<f64>,
    pub pauses: u32,
    pub resumes: u32,
    pub stops: u32,
}

pub struct MockVoice {
    pub state: Arc<Mutex<MockVoiceState>>,
}

impl Voice for MockVoice {
    fn is_valid(&self) -> bool {
        self.state.lock().unwrap().valid
    }

    fn is_playing(&self) -> bool {
        let s = self.state.lock().unwrap();
        s.valid && s.playing
    }

    fn raw_position_ms(&self) -> f64 {
        self.state.lock().unwrap().raw_position_ms
    }

    fn pause(&mut self) {
        let mut s = self.state.lock().unwrap();
        s.playing = false;
        s.pauses += 1;
    }

    fn resume(&mut self) {
        let mut s = self.state.lock().unwrap();
        if s.valid {
            s.playing = true;
        }
        s.resumes += 1;
    }

    fn stop(&mut self) {
        let mut s = self.state.lock().unwrap();
        s.valid = false;
        s.playing = false;
        s.stops += 1;
    }

    fn set_volume(&mut self, volume: f32) {
        self.state.lock().unwrap().volume = volume;
    }

    fn set_pan(&mut self, pan: f32) {
        self.state.lock().unwrap().pan = pan;
    }

    fn set_speed(&mut self, speed: f32, mode: SpeedMode) {
        let mut s = self.state.lock().unwrap();
        s.speed = speed;
        s.mode = mode;
    }

    fn set_pitch(&mut self, pitch: f32) {
        self.state.lock().unwrap().pitch = pitch;
    }

    fn set_frequency_ratio(&mut self, ratio: f32) {
        self.state.lock().unwrap().freq_ratio = ratio;
    }

    fn set_looped(&mut self, looped: bool) {
        self.state.lock().unwrap().looped = looped;
    }

    fn seek_forward_ms(&mut self, target_ms: f64) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.forward_seeks.push(target_ms);
        s.raw_position_ms = target_ms;
        Ok(())
    }

    fn seek_fast_ms(&mut self, target_ms: f64) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.fast_seeks.push(target_ms);
        s.raw_position_ms = target_ms;
        Ok(())
    }
}

pub struct MockMixer {
    pub ready: bool,
    /// Number of upcoming `init` calls that fail, counting down.
    pub fail_inits: u32,
    pub fail_play: bool,
    pub master_volume: f32,
    pub voice_ceiling: u32,
    pub init_count: u32,
    pub last_device: Option<String>,
    /// Every voice ever started, shared with the returned handles.
    pub played: Vec<Arc<Mutex<MockVoiceState>>>,
    next_id: u64,
}

impl Default for MockMixer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMixer {
    pub fn new() -> Self {
        Self {
            ready: false,
            fail_inits: 0,
            fail_play: false,
            master_volume: 1.0,
            voice_ceiling: 0,
            init_count: 0,
            last_device: None,
            played: Vec::new(),
            next_id: 0,
        }
    }

    pub fn last_voice(&self) -> Arc<Mutex<MockVoiceState>> {
        Arc::clone(self.played.last().expect("no voice played"))
    }
}

impl Mixer for MockMixer {
    type Source = MockSource;
    type Voice = MockVoice;

    const DRIVER: crate::engine::device::DriverKind = crate::engine::device::DriverKind::Mix;

    fn init(&mut self, device: &OutputDevice, config: &AudioConfig) -> Result<()> {
        self.shutdown();
        self.init_count += 1;
        if self.fail_inits > 0 {
            self.fail_inits -= 1;
            self.ready = false;
            bail!("scripted init failure");
        }
        self.ready = true;
        self.last_device = Some(device.name.clone());
        self.master_volume = config.master_volume;
        self.voice_ceiling = config.clamped_voice_ceiling();
        Ok(())
    }

    fn shutdown(&mut self) {
        self.ready = false;
        for voice in &self.played {
            let mut s = voice.lock().unwrap();
            s.valid = false;
            s.playing = false;
        }
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn set_master_volume(&mut self, volume: f32) {
        self.master_volume = volume;
    }

    fn set_voice_ceiling(&mut self, ceiling: u32) {
        self.voice_ceiling = ceiling;
    }

    fn active_voice_count(&self) -> usize {
        self.played
            .iter()
            .filter(|v| v.lock().unwrap().valid)
            .count()
    }

    fn open_source(
        path: &Path,
        desc: &SoundDesc,
        _config: &AudioConfig,
    ) -> Result<OpenedSource<MockSource>> {
        // scripted failure hook for load tests
        if path.to_string_lossy().contains("unopenable") {
            bail!("scripted open failure");
        }
        Ok(OpenedSource {
            source: MockSource {
                path: path.to_path_buf(),
                desc: desc.clone(),
            },
            length_ms: MOCK_LENGTH_MS,
            base_sample_rate: MOCK_SAMPLE_RATE,
        })
    }

    fn play(&mut self, _source: &mut MockSource, params: &PlayParams) -> Result<MockVoice> {
        if !self.ready {
            bail!("mock mixer is not running");
        }
        if self.fail_play {
            bail!("scripted play failure");
        }
        self.next_id += 1;
        let state = Arc::new(Mutex::new(MockVoiceState {
            id: self.next_id,
            valid: true,
            playing: !params.paused,
            raw_position_ms: params.start_ms,
            volume: params.volume,
            pan: params.pan,
            speed: params.speed,
            mode: params.speed_mode,
            pitch: params.pitch,
            freq_ratio: 1.0,
            looped: params.looped,
            protected: params.protected,
            forward_seeks: Vec::new(),
            fast_seeks: Vec::new(),
            pauses: 0,
            resumes: 0,
            stops: 0,
        }));
        self.played.push(Arc::clone(&state));
        Ok(MockVoice { state })
    }
}
