//! Forward-only symphonia decode context for stream voices.
//!
//! A [`StreamDecoder`] can only move forward once opened; backward movement
//! is done by dropping it and opening a fresh one, which is exactly what the
//! sound model's backward-seek path does.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};
use tracing::debug;

/// Facts about a stream learned at open time.
#[derive(Debug, Clone, Copy)]
pub struct StreamInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub length_ms: u64,
}

pub struct StreamDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    info: StreamInfo,
    /// Frames handed out so far; the decode head position.
    decoded_frames: u64,
    path: PathBuf,
}

impl StreamDecoder {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|s| s.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .with_context(|| format!("unrecognized container: {}", path.display()))?;
        let reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| anyhow!("no decodable track in {}", path.display()))?;
        let track_id = track.id;

        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| anyhow!("unknown sample rate in {}", path.display()))?;
        let channels = track
            .codec_params
            .channels
            .map(|c| c.count() as u16)
            .unwrap_or(2);
        if channels == 0 {
            bail!("zero-channel track in {}", path.display());
        }
        let length_ms = track
            .codec_params
            .n_frames
            .map(|frames| frames * 1000 / sample_rate as u64)
            .unwrap_or(0);

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .with_context(|| format!("no decoder for {}", path.display()))?;

        let time_base = reader
            .tracks()
            .iter()
            .find(|t| t.id == track_id)
            .and_then(|t| t.codec_params.time_base);

        Ok(Self {
            reader,
            decoder,
            track_id,
            time_base,
            info: StreamInfo {
                sample_rate,
                channels,
                length_ms,
            },
            decoded_frames: 0,
            path: path.to_path_buf(),
        })
    }

    /// Open, read the stream facts, and discard the context.
    pub fn probe_info(path: &Path) -> Result<StreamInfo> {
        Ok(Self::open(path)?.info)
    }

    pub fn info(&self) -> StreamInfo {
        self.info
    }

    /// Current decode head position.
    pub fn decoded_ms(&self) -> f64 {
        self.decoded_frames as f64 * 1000.0 / self.info.sample_rate as f64
    }

    /// Decode the next chunk of interleaved f32 samples. `Ok(None)` = end
    /// of stream. Corrupt packets are skipped, not fatal.
    pub fn decode_next(&mut self) -> Result<Option<Vec<f32>>> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(e) => return Err(e).context("packet read failed"),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(audio_buf) => {
                    let spec = *audio_buf.spec();
                    let mut sample_buf =
                        SampleBuffer::<f32>::new(audio_buf.capacity() as u64, spec);
                    sample_buf.copy_interleaved_ref(audio_buf);
                    let samples = sample_buf.samples().to_vec();
                    self.decoded_frames += (samples.len() / self.info.channels as usize) as u64;
                    return Ok(Some(samples));
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    debug!("skipping corrupt packet in {}: {e}", self.path.display());
                    continue;
                }
                Err(e) => return Err(e).context("decode failed"),
            }
        }
    }

    /// Forward-decode until the decode head reaches `target_ms`, discarding
    /// the audio. Does nothing when the head is already at or past it.
    pub fn decode_to_ms(&mut self, target_ms: f64) -> Result<()> {
        while self.decoded_ms() < target_ms {
            if self.decode_next()?.is_none() {
                break;
            }
        }
        Ok(())
    }

    /// Inaccurate seek straight to `target_ms` through the container index.
    /// Precision depends on packet granularity; fine for previews.
    pub fn seek_coarse_ms(&mut self, target_ms: f64) -> Result<()> {
        let seeked = self
            .reader
            .seek(
                SeekMode::Coarse,
                SeekTo::Time {
                    time: Time::from(target_ms.max(0.0) / 1000.0),
                    track_id: Some(self.track_id),
                },
            )
            .context("coarse seek failed")?;
        self.decoder.reset();
        let landed_secs = match self.time_base {
            Some(tb) => {
                let t = tb.calc_time(seeked.actual_ts);
                t.seconds as f64 + t.frac
            }
            None => seeked.actual_ts as f64 / self.info.sample_rate as f64,
        };
        self.decoded_frames = (landed_secs * self.info.sample_rate as f64) as u64;
        Ok(())
    }

    /// Restart decoding from the beginning of the file.
    pub fn rewind(&mut self) -> Result<()> {
        *self = Self::open(&self.path)?;
        Ok(())
    }
}

/// Minimal valid mono 16-bit PCM WAV, for decode tests here and in the
/// backends that reuse this pipeline.
#[cfg(test)]
pub(crate) fn write_test_wav(path: &Path, sample_rate: u32, frames: usize) {
    use std::io::Write;

    let data_len = (frames * 2) as u32;
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
    bytes.extend_from_slice(b"WAVEfmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
    bytes.extend_from_slice(&1u16.to_le_bytes()); // mono
    bytes.extend_from_slice(&sample_rate.to_le_bytes());
    bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    bytes.extend_from_slice(&2u16.to_le_bytes());
    bytes.extend_from_slice(&16u16.to_le_bytes());
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&data_len.to_le_bytes());
    for i in 0..frames {
        let s = ((i as f32 * 0.01).sin() * 16000.0) as i16;
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    File::create(path).unwrap().write_all(&bytes).unwrap();
}
