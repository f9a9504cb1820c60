//! Software mix-bus backend over cpal, decoding through symphonia.
//!
//! Every voice is a slot on one shared bus that the cpal output callback
//! drains. Sample voices read fully decoded PCM straight from memory; stream
//! voices are fed by a per-voice decode thread that pushes through the
//! time-stretch filter into a ring the callback consumes.
//!
//! Stream voices report their position as the decode head minus what is
//! still buffered in the ring and the stretch filter, so the readout tracks
//! what is actually audible rather than what has been decoded.

pub mod stream;
pub mod stretch;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, info, warn};

use crate::config::AudioConfig;
use crate::engine::device::OutputDevice;

use super::{Mixer, OpenedSource, PlayParams, SoundDesc, SpeedMode, Voice};
use stream::{StreamDecoder, StreamInfo};
use stretch::TimeStretch;

/// Ring target kept ahead of the output callback, in source milliseconds.
const RING_TARGET_MS: f64 = 200.0;
/// Feeder sleep while the ring is full.
const FEEDER_IDLE_SLEEP: Duration = Duration::from_millis(3);

pub(crate) fn store_f32(cell: &AtomicU32, value: f32) {
    cell.store(value.to_bits(), Ordering::Relaxed);
}

pub(crate) fn load_f32(cell: &AtomicU32) -> f32 {
    f32::from_bits(cell.load(Ordering::Relaxed))
}

pub(crate) fn store_f64(cell: &AtomicU64, value: f64) {
    cell.store(value.to_bits(), Ordering::Relaxed);
}

pub(crate) fn load_f64(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Ordering::Relaxed))
}

/// Fully decoded interleaved PCM for one-shot samples.
pub struct DecodedPcm {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl DecodedPcm {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn length_ms(&self) -> u64 {
        self.frames() as u64 * 1000 / self.sample_rate as u64
    }
}

/// A decodable asset as the mix backend sees it.
pub enum MixSource {
    /// Decoded up front at load time.
    Sample(Arc<DecodedPcm>),
    /// Decoded on demand by a feeder thread per play.
    Stream { path: PathBuf, info: StreamInfo },
}

/// Control block shared between a [`MixVoice`], its bus slot, and (for
/// streams) the feeder thread.
struct VoiceCtrl {
    id: u64,
    playing: AtomicBool,
    stop_requested: AtomicBool,
    finished: AtomicBool,
    protected: bool,
    volume: AtomicU32,
    pan: AtomicU32,
    /// Source frames consumed per output frame (sample-rate conversion and
    /// pitch folded together).
    resample_ratio: AtomicU32,
    looped: AtomicBool,
    /// Raw position in ms, published by the callback for sample voices.
    position_ms: AtomicU64,
    /// Pending sample-voice seek in source frames; `u64::MAX` = none.
    seek_frames: AtomicU64,
}

impl VoiceCtrl {
    fn new(id: u64, params: &PlayParams) -> Self {
        let ctrl = Self {
            id,
            playing: AtomicBool::new(!params.paused),
            stop_requested: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            protected: params.protected,
            volume: AtomicU32::new(0),
            pan: AtomicU32::new(0),
            resample_ratio: AtomicU32::new(0),
            looped: AtomicBool::new(params.looped),
            position_ms: AtomicU64::new(0),
            seek_frames: AtomicU64::new(u64::MAX),
        };
        store_f32(&ctrl.volume, params.volume);
        store_f32(&ctrl.pan, params.pan);
        store_f64(&ctrl.position_ms, params.start_ms);
        ctrl
    }
}

pub(crate) struct SeekRequest {
    pub(crate) target_ms: f64,
    pub(crate) accurate: bool,
}

/// Shared state between a stream voice's feeder thread and whichever mixer
/// side consumes it (the mix-bus callback here, the stretch sound on the
/// tempo backend).
pub(crate) struct StreamRing {
    /// Stretched, still source-rate interleaved audio waiting to be mixed.
    pub(crate) buf: Mutex<VecDeque<f32>>,
    pub(crate) channels: u16,
    pub(crate) sample_rate: u32,
    /// Feeder reached end of stream (and the voice is not looped).
    pub(crate) done: AtomicBool,
    /// Ask the feeder to exit.
    pub(crate) quit: AtomicBool,
    pub(crate) seek_request: Mutex<Option<SeekRequest>>,
    pub(crate) stretch_speed: AtomicU32,
    pub(crate) looped: AtomicBool,
    /// Decode head in ms, published by the feeder.
    pub(crate) base_ms: AtomicU64,
    /// Stretch filter delay in ms, published by the feeder.
    pub(crate) latency_ms: AtomicU64,
}

impl StreamRing {
    pub(crate) fn new(info: StreamInfo, params: &PlayParams) -> Self {
        let ring = Self {
            buf: Mutex::new(VecDeque::new()),
            channels: info.channels,
            sample_rate: info.sample_rate,
            done: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            seek_request: Mutex::new(None),
            stretch_speed: AtomicU32::new(1.0f32.to_bits()),
            looped: AtomicBool::new(params.looped),
            base_ms: AtomicU64::new(0),
            latency_ms: AtomicU64::new(0),
        };
        store_f64(&ring.base_ms, params.start_ms);
        ring
    }

    pub(crate) fn buffered_frames(&self) -> usize {
        self.buf.lock().map(|b| b.len()).unwrap_or(0) / self.channels as usize
    }

    /// Estimate of the audible position: decode head minus what is still in
    /// flight inside the stretch filter and the ring.
    pub(crate) fn audible_ms(&self) -> f64 {
        let speed = f32::from_bits(self.stretch_speed.load(Ordering::Relaxed)) as f64;
        let buffered_src_ms =
            self.buffered_frames() as f64 * speed * 1000.0 / self.sample_rate as f64;
        (load_f64(&self.base_ms) - buffered_src_ms - load_f64(&self.latency_ms)).max(0.0)
    }
}

/// Per-slot playback state owned by the audio callback.
enum Feed {
    Pcm {
        data: Arc<DecodedPcm>,
        cursor: f64,
    },
    Ring {
        ring: Arc<StreamRing>,
        /// Linear-interpolation state across callback invocations.
        frac: f64,
        cur: [f32; 2],
        nxt: [f32; 2],
        primed: bool,
    },
}

struct VoiceSlot {
    ctrl: Arc<VoiceCtrl>,
    feed: Feed,
}

struct Bus {
    slots: Mutex<Vec<VoiceSlot>>,
    master_volume: AtomicU32,
}

impl Bus {
    fn new(master_volume: f32) -> Self {
        let bus = Self {
            slots: Mutex::new(Vec::new()),
            master_volume: AtomicU32::new(0),
        };
        store_f32(&bus.master_volume, master_volume);
        bus
    }
}

/// The simple-mix backend.
pub struct StreamMixer {
    bus: Arc<Bus>,
    stream: Option<cpal::Stream>,
    out_rate: u32,
    out_channels: u16,
    voice_ceiling: u32,
    next_voice_id: u64,
}

impl Default for StreamMixer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamMixer {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(Bus::new(1.0)),
            stream: None,
            out_rate: 44100,
            out_channels: 2,
            voice_ceiling: crate::config::MIN_VOICE_CEILING,
            next_voice_id: 0,
        }
    }

    fn find_cpal_device(device: &OutputDevice) -> Result<cpal::Device> {
        let host = cpal::default_host();
        if device.is_default || device.id < 0 {
            return host
                .default_output_device()
                .ok_or_else(|| anyhow!("no default output device"));
        }
        let mut devices = host.output_devices().context("device enumeration failed")?;
        devices
            .find(|d| d.name().map(|n| n == device.name).unwrap_or(false))
            .ok_or_else(|| anyhow!("output device '{}' not found", device.name))
    }

    /// Make room for one more voice, stealing the oldest unprotected slot
    /// when the ceiling is hit.
    fn reserve_slot(&self, slots: &mut Vec<VoiceSlot>) -> Result<()> {
        slots.retain(|s| !s.ctrl.finished.load(Ordering::Relaxed));
        if (slots.len() as u32) < self.voice_ceiling {
            return Ok(());
        }
        let victim = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.ctrl.protected)
            .min_by_key(|(_, s)| s.ctrl.id)
            .map(|(i, _)| i);
        match victim {
            Some(i) => {
                let slot = slots.remove(i);
                slot.ctrl.finished.store(true, Ordering::Relaxed);
                if let Feed::Ring { ring, .. } = &slot.feed {
                    ring.quit.store(true, Ordering::Relaxed);
                }
                debug!("voice ceiling reached, stole voice {}", slot.ctrl.id);
                Ok(())
            }
            None => bail!("voice ceiling reached and every voice is protected"),
        }
    }
}

impl Mixer for StreamMixer {
    type Source = MixSource;
    type Voice = MixVoice;

    const DRIVER: crate::engine::device::DriverKind = crate::engine::device::DriverKind::Mix;

    fn init(&mut self, device: &OutputDevice, config: &AudioConfig) -> Result<()> {
        self.shutdown();

        let cpal_device = Self::find_cpal_device(device)?;
        let default_config = cpal_device
            .default_output_config()
            .context("no default output config")?;
        let sample_format = default_config.sample_format();
        let mut stream_config: cpal::StreamConfig = default_config.into();
        if config.sample_rate != 0 {
            stream_config.sample_rate = cpal::SampleRate(config.sample_rate);
        }
        if config.buffer_size != 0 {
            stream_config.buffer_size = cpal::BufferSize::Fixed(config.buffer_size);
        }

        self.out_rate = stream_config.sample_rate.0;
        self.out_channels = stream_config.channels;
        self.voice_ceiling = config.clamped_voice_ceiling();
        store_f32(&self.bus.master_volume, config.master_volume);

        let bus = Arc::clone(&self.bus);
        let channels = self.out_channels as usize;
        let err_fn = |e| warn!("output stream error: {e}");
        let stream = match sample_format {
            cpal::SampleFormat::F32 => cpal_device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    mix_into(&bus, channels, data);
                },
                err_fn,
                None,
            ),
            cpal::SampleFormat::I16 => {
                let mut scratch: Vec<f32> = Vec::new();
                cpal_device.build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        scratch.resize(data.len(), 0.0);
                        mix_into(&bus, channels, &mut scratch);
                        for (out, &s) in data.iter_mut().zip(scratch.iter()) {
                            *out = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
                        }
                    },
                    err_fn,
                    None,
                )
            }
            other => bail!("unsupported output sample format {other}"),
        }
        .context("failed to build output stream")?;
        stream.play().context("failed to start output stream")?;

        info!(
            device = %device.name,
            rate = self.out_rate,
            channels = self.out_channels,
            "mix bus online"
        );
        self.stream = Some(stream);
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Ok(mut slots) = self.bus.slots.lock() {
            for slot in slots.drain(..) {
                slot.ctrl.finished.store(true, Ordering::Relaxed);
                if let Feed::Ring { ring, .. } = &slot.feed {
                    ring.quit.store(true, Ordering::Relaxed);
                }
            }
        }
        self.stream = None;
    }

    fn is_ready(&self) -> bool {
        self.stream.is_some()
    }

    fn set_master_volume(&mut self, volume: f32) {
        store_f32(&self.bus.master_volume, volume);
    }

    fn set_voice_ceiling(&mut self, ceiling: u32) {
        self.voice_ceiling = ceiling;
    }

    fn active_voice_count(&self) -> usize {
        self.bus
            .slots
            .lock()
            .map(|s| {
                s.iter()
                    .filter(|slot| !slot.ctrl.finished.load(Ordering::Relaxed))
                    .count()
            })
            .unwrap_or(0)
    }

    fn open_source(
        path: &Path,
        desc: &SoundDesc,
        _config: &AudioConfig,
    ) -> Result<OpenedSource<MixSource>> {
        if desc.stream {
            let info = StreamDecoder::probe_info(path)?;
            Ok(OpenedSource {
                length_ms: info.length_ms,
                base_sample_rate: info.sample_rate,
                source: MixSource::Stream {
                    path: path.to_path_buf(),
                    info,
                },
            })
        } else {
            let mut dec = StreamDecoder::open(path)?;
            let info = dec.info();
            let mut samples = Vec::new();
            while let Some(chunk) = dec.decode_next()? {
                samples.extend_from_slice(&chunk);
            }
            if samples.is_empty() {
                bail!("no audio frames in {}", path.display());
            }
            let pcm = DecodedPcm {
                samples,
                channels: info.channels,
                sample_rate: info.sample_rate,
            };
            Ok(OpenedSource {
                length_ms: pcm.length_ms(),
                base_sample_rate: info.sample_rate,
                source: MixSource::Sample(Arc::new(pcm)),
            })
        }
    }

    fn play(&mut self, source: &mut MixSource, params: &PlayParams) -> Result<MixVoice> {
        if self.stream.is_none() {
            bail!("mix bus is not running");
        }

        // a full bus must refuse before any feeder thread exists, otherwise
        // the error return would strand a decode thread with no owner
        {
            let mut slots = self
                .bus
                .slots
                .lock()
                .map_err(|_| anyhow!("mix bus poisoned"))?;
            self.reserve_slot(&mut slots)?;
        }

        self.next_voice_id += 1;
        let ctrl = Arc::new(VoiceCtrl::new(self.next_voice_id, params));

        let (feed, ring, src_rate) = match source {
            MixSource::Sample(pcm) => {
                let cursor = params.start_ms / 1000.0 * pcm.sample_rate as f64;
                (
                    Feed::Pcm {
                        data: Arc::clone(pcm),
                        cursor,
                    },
                    None,
                    pcm.sample_rate,
                )
            }
            MixSource::Stream { path, info } => {
                let mut dec = StreamDecoder::open(path)?;
                if params.start_ms > 0.0 {
                    dec.decode_to_ms(params.start_ms)?;
                }
                let ring = Arc::new(StreamRing::new(*info, params));
                store_f64(&ring.base_ms, dec.decoded_ms());
                let feeder_ring = Arc::clone(&ring);
                std::thread::Builder::new()
                    .name("kumi-audio-feeder".to_string())
                    .spawn(move || feeder_loop(dec, feeder_ring))
                    .context("failed to spawn feeder thread")?;
                (
                    Feed::Ring {
                        ring: Arc::clone(&ring),
                        frac: 0.0,
                        cur: [0.0; 2],
                        nxt: [0.0; 2],
                        primed: false,
                    },
                    Some(ring),
                    info.sample_rate,
                )
            }
        };

        let mut voice = MixVoice {
            ctrl: Arc::clone(&ctrl),
            ring,
            src_rate,
            out_rate: self.out_rate,
            speed: params.speed,
            pitch: params.pitch,
            freq_ratio: 1.0,
            mode: params.speed_mode,
        };
        voice.apply_rates();

        match self.bus.slots.lock() {
            Ok(mut slots) => slots.push(VoiceSlot { ctrl, feed }),
            Err(_) => {
                voice.stop();
                bail!("mix bus poisoned");
            }
        }
        Ok(voice)
    }
}

impl Drop for StreamMixer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decode thread for one stream voice.
pub(crate) fn feeder_loop(mut dec: StreamDecoder, ring: Arc<StreamRing>) {
    let info = dec.info();
    let mut filter = TimeStretch::new(info.sample_rate, info.channels as usize);
    let target_frames =
        (RING_TARGET_MS / 1000.0 * info.sample_rate as f64) as usize;
    let mut stretched = Vec::new();

    loop {
        if ring.quit.load(Ordering::Relaxed) {
            return;
        }

        let request = ring.seek_request.lock().ok().and_then(|mut r| r.take());
        if let Some(req) = request {
            if let Ok(mut buf) = ring.buf.lock() {
                buf.clear();
            }
            filter.reset();
            let outcome = if req.accurate {
                if req.target_ms < dec.decoded_ms() {
                    dec.rewind().and_then(|_| dec.decode_to_ms(req.target_ms))
                } else {
                    dec.decode_to_ms(req.target_ms)
                }
            } else {
                dec.seek_coarse_ms(req.target_ms)
            };
            if let Err(e) = outcome {
                warn!("stream seek failed: {e:#}");
                ring.done.store(true, Ordering::Relaxed);
                return;
            }
            ring.done.store(false, Ordering::Relaxed);
            store_f64(&ring.base_ms, dec.decoded_ms());
        }

        let wanted = f32::from_bits(ring.stretch_speed.load(Ordering::Relaxed)) as f64;
        if (wanted - filter.speed()).abs() > f64::EPSILON {
            filter.set_speed(wanted);
        }

        if ring.buffered_frames() >= target_frames {
            std::thread::sleep(FEEDER_IDLE_SLEEP);
            continue;
        }

        match dec.decode_next() {
            Ok(Some(chunk)) => {
                filter.push(&chunk);
                stretched.clear();
                filter.pull(&mut stretched);
                if let Ok(mut buf) = ring.buf.lock() {
                    buf.extend(stretched.iter().copied());
                }
                store_f64(&ring.base_ms, dec.decoded_ms());
                store_f64(&ring.latency_ms, filter.latency_ms());
            }
            Ok(None) => {
                if ring.looped.load(Ordering::Relaxed) {
                    if let Err(e) = dec.rewind() {
                        warn!("loop rewind failed: {e:#}");
                        ring.done.store(true, Ordering::Relaxed);
                        return;
                    }
                    store_f64(&ring.base_ms, 0.0);
                } else {
                    ring.done.store(true, Ordering::Relaxed);
                    return;
                }
            }
            Err(e) => {
                warn!("stream decode failed: {e:#}");
                ring.done.store(true, Ordering::Relaxed);
                return;
            }
        }
    }
}

/// Mix every live slot into `data` (interleaved, already zeroed or not).
fn mix_into(bus: &Bus, out_channels: usize, data: &mut [f32]) {
    data.fill(0.0);
    let master = load_f32(&bus.master_volume);
    let Ok(mut slots) = bus.slots.lock() else {
        return;
    };
    for slot in slots.iter_mut() {
        mix_slot(slot, master, out_channels, data);
    }
    slots.retain(|s| !s.ctrl.finished.load(Ordering::Relaxed));
    for s in data.iter_mut() {
        *s = s.clamp(-1.0, 1.0);
    }
}

fn gains(ctrl: &VoiceCtrl, master: f32) -> (f32, f32) {
    // applied volume is capped at 1.0 on this backend
    let vol = (load_f32(&ctrl.volume) * master).min(1.0).max(0.0);
    let pan = load_f32(&ctrl.pan).clamp(-1.0, 1.0);
    (vol * (1.0 - pan.max(0.0)), vol * (1.0 + pan.min(0.0)))
}

fn write_frame(data: &mut [f32], frame: usize, out_channels: usize, l: f32, r: f32) {
    let base = frame * out_channels;
    if out_channels == 1 {
        data[base] += (l + r) * 0.5;
    } else {
        data[base] += l;
        data[base + 1] += r;
    }
}

fn mix_slot(slot: &mut VoiceSlot, master: f32, out_channels: usize, data: &mut [f32]) {
    let ctrl = &slot.ctrl;
    if ctrl.stop_requested.load(Ordering::Relaxed) {
        ctrl.finished.store(true, Ordering::Relaxed);
        if let Feed::Ring { ring, .. } = &slot.feed {
            ring.quit.store(true, Ordering::Relaxed);
        }
        return;
    }
    if !ctrl.playing.load(Ordering::Relaxed) {
        return;
    }

    let out_frames = data.len() / out_channels;
    let (l_gain, r_gain) = gains(ctrl, master);
    let ratio = load_f32(&ctrl.resample_ratio) as f64;

    match &mut slot.feed {
        Feed::Pcm { data: pcm, cursor } => {
            let seek = ctrl.seek_frames.swap(u64::MAX, Ordering::Relaxed);
            if seek != u64::MAX {
                *cursor = seek as f64;
            }
            let ch = pcm.channels as usize;
            let frames = pcm.frames();
            for frame in 0..out_frames {
                let idx = *cursor as usize;
                if idx + 1 >= frames {
                    if ctrl.looped.load(Ordering::Relaxed) && frames > 1 {
                        *cursor -= (frames - 1) as f64;
                        continue;
                    }
                    ctrl.finished.store(true, Ordering::Relaxed);
                    break;
                }
                let t = (*cursor - idx as f64) as f32;
                let (l, r) = if ch == 1 {
                    let s = pcm.samples[idx] + (pcm.samples[idx + 1] - pcm.samples[idx]) * t;
                    (s, s)
                } else {
                    let a = idx * ch;
                    let b = (idx + 1) * ch;
                    (
                        pcm.samples[a] + (pcm.samples[b] - pcm.samples[a]) * t,
                        pcm.samples[a + 1] + (pcm.samples[b + 1] - pcm.samples[a + 1]) * t,
                    )
                };
                write_frame(data, frame, out_channels, l * l_gain, r * r_gain);
                *cursor += ratio;
            }
            store_f64(
                &ctrl.position_ms,
                *cursor / pcm.sample_rate as f64 * 1000.0,
            );
        }
        Feed::Ring {
            ring,
            frac,
            cur,
            nxt,
            primed,
        } => {
            let ch = ring.channels as usize;
            let Ok(mut buf) = ring.buf.lock() else {
                return;
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

            for frame in 0..out_frames {
                if !*primed {
                    let (Some(a), Some(b)) = (pop_frame(&mut buf), pop_frame(&mut buf)) else {
                        if ring.done.load(Ordering::Relaxed) {
                            ctrl.finished.store(true, Ordering::Relaxed);
                        }
                        break;
                    };
                    *cur = a;
                    *nxt = b;
                    *primed = true;
                }
                let t = *frac as f32;
                let l = cur[0] + (nxt[0] - cur[0]) * t;
                let r = cur[1] + (nxt[1] - cur[1]) * t;
                write_frame(data, frame, out_channels, l * l_gain, r * r_gain);

                *frac += ratio;
                while *frac >= 1.0 {
                    *frac -= 1.0;
                    *cur = *nxt;
                    match pop_frame(&mut buf) {
                        Some(f) => *nxt = f,
                        None => {
                            // underrun: hold the last frame, re-prime later
                            *primed = false;
                            if ring.done.load(Ordering::Relaxed) {
                                ctrl.finished.store(true, Ordering::Relaxed);
                            }
                            break;
                        }
                    }
                }
                if !*primed && ctrl.finished.load(Ordering::Relaxed) {
                    break;
                }
            }
        }
    }
}

/// Voice handle returned by [`StreamMixer::play`].
pub struct MixVoice {
    ctrl: Arc<VoiceCtrl>,
    ring: Option<Arc<StreamRing>>,
    src_rate: u32,
    out_rate: u32,
    speed: f32,
    pitch: f32,
    freq_ratio: f32,
    mode: SpeedMode,
}

impl MixVoice {
    /// Re-derive the stretch factor and resample ratio from the current
    /// speed, pitch, frequency override, and speed mode.
    fn apply_rates(&mut self) {
        let (stretch, user_resample) = match (self.mode, &self.ring) {
            (SpeedMode::TempoPreserving, Some(_)) => (self.speed, self.pitch * self.freq_ratio),
            // pitch-coupled, and every sample voice: rate change at the resampler
            _ => (1.0, self.speed * self.pitch * self.freq_ratio),
        };
        let ratio = user_resample * self.src_rate as f32 / self.out_rate as f32;
        store_f32(&self.ctrl.resample_ratio, ratio.max(0.0));
        if let Some(ring) = &self.ring {
            ring.stretch_speed
                .store(stretch.max(0.05).to_bits(), Ordering::Relaxed);
        }
    }
}

impl Voice for MixVoice {
    fn is_valid(&self) -> bool {
        !self.ctrl.finished.load(Ordering::Relaxed)
            && !self.ctrl.stop_requested.load(Ordering::Relaxed)
    }

    fn is_playing(&self) -> bool {
        self.is_valid() && self.ctrl.playing.load(Ordering::Relaxed)
    }

    fn raw_position_ms(&self) -> f64 {
        match &self.ring {
            Some(ring) => ring.audible_ms(),
            None => load_f64(&self.ctrl.position_ms),
        }
    }

    fn pause(&mut self) {
        self.ctrl.playing.store(false, Ordering::Relaxed);
    }

    fn resume(&mut self) {
        if self.is_valid() {
            self.ctrl.playing.store(true, Ordering::Relaxed);
        }
    }

    fn stop(&mut self) {
        self.ctrl.stop_requested.store(true, Ordering::Relaxed);
        if let Some(ring) = &self.ring {
            ring.quit.store(true, Ordering::Relaxed);
        }
    }

    fn set_volume(&mut self, volume: f32) {
        store_f32(&self.ctrl.volume, volume);
    }

    fn set_pan(&mut self, pan: f32) {
        store_f32(&self.ctrl.pan, pan);
    }

    fn set_speed(&mut self, speed: f32, mode: SpeedMode) {
        self.speed = speed;
        self.mode = mode;
        self.apply_rates();
    }

    fn set_pitch(&mut self, pitch: f32) {
        self.pitch = pitch;
        self.apply_rates();
    }

    fn set_frequency_ratio(&mut self, ratio: f32) {
        self.freq_ratio = ratio;
        self.apply_rates();
    }

    fn set_looped(&mut self, looped: bool) {
        self.ctrl.looped.store(looped, Ordering::Relaxed);
        if let Some(ring) = &self.ring {
            ring.looped.store(looped, Ordering::Relaxed);
        }
    }

    fn seek_forward_ms(&mut self, target_ms: f64) -> Result<()> {
        match &self.ring {
            Some(ring) => {
                if ring.done.load(Ordering::Relaxed) {
                    bail!("stream voice already finished");
                }
                let mut req = ring
                    .seek_request
                    .lock()
                    .map_err(|_| anyhow!("feeder state poisoned"))?;
                *req = Some(SeekRequest {
                    target_ms,
                    accurate: true,
                });
                Ok(())
            }
            None => {
                let frames = (target_ms / 1000.0 * self.src_rate as f64).max(0.0) as u64;
                self.ctrl.seek_frames.store(frames, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    fn seek_fast_ms(&mut self, target_ms: f64) -> Result<()> {
        match &self.ring {
            Some(ring) => {
                let mut req = ring
                    .seek_request
                    .lock()
                    .map_err(|_| anyhow!("feeder state poisoned"))?;
                *req = Some(SeekRequest {
                    target_ms,
                    accurate: false,
                });
                Ok(())
            }
            None => self.seek_forward_ms(target_ms),
        }
    }
}

impl Drop for MixVoice {
    fn drop(&mut self) {
        // the slot keeps mixing; only the feeder must not outlive its sound
        if !self.is_valid() {
            if let Some(ring) = &self.ring {
                ring.quit.store(true, Ordering::Relaxed);
            }
        }
    }
}
