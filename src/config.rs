use serde::{Deserialize, Serialize};

/// Audio system configuration.
///
/// All fields are runtime options; the engine reads them at device init and
/// on the relevant setters. Persisted by the host application (typically as
/// JSON alongside the rest of its settings).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Master volume (0.0 - 1.0).
    pub master_volume: f32,
    /// Persisted output device name; empty means "use the default device".
    pub output_device: String,
    /// Preferred sample rate in Hz; 0 lets the device negotiate.
    pub sample_rate: u32,
    /// Preferred output buffer size in frames; 0 lets the device negotiate.
    pub buffer_size: u32,
    /// Maximum number of simultaneously mixed voices. Clamped to
    /// [`MIN_VOICE_CEILING`]..=[`MAX_VOICE_CEILING`] when applied.
    pub max_simultaneous_voices: u32,
    /// When true, speed changes rewrite the output sample rate (shifting
    /// pitch along with tempo) instead of going through the time-stretcher.
    pub pitch_coupled_speed: bool,
    /// Ask the backend to buffer file reads asynchronously where supported.
    pub async_buffered_decode: bool,
    /// Smooth backend position readouts through the playback interpolator.
    pub interpolate_position: bool,
    /// Minimum file sizes in bytes below which a file is ignored outright.
    /// Some decoders misbehave on truncated files, so these are load-bearing.
    pub min_wav_file_size: u64,
    pub min_mp3_file_size: u64,
    pub min_ogg_file_size: u64,
    pub min_flac_file_size: u64,
}

/// Lowest allowed voice ceiling. Mixers misbehave below this.
pub const MIN_VOICE_CEILING: u32 = 64;
/// Highest allowed voice ceiling.
pub const MAX_VOICE_CEILING: u32 = 255;

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            master_volume: 1.0,
            output_device: String::new(),
            sample_rate: 0,
            buffer_size: 0,
            max_simultaneous_voices: 128,
            pitch_coupled_speed: false,
            async_buffered_decode: true,
            interpolate_position: true,
            min_wav_file_size: 51,
            min_mp3_file_size: 256,
            min_ogg_file_size: 0,
            min_flac_file_size: 96,
        }
    }
}

impl AudioConfig {
    /// Voice ceiling clamped into the supported range.
    pub fn clamped_voice_ceiling(&self) -> u32 {
        self.max_simultaneous_voices
            .clamp(MIN_VOICE_CEILING, MAX_VOICE_CEILING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = AudioConfig::default();
        assert!((config.master_volume - 1.0).abs() < f32::EPSILON);
        assert_eq!(config.sample_rate, 0);
        assert_eq!(config.buffer_size, 0);
        assert!(config.interpolate_position);
        assert!(!config.pitch_coupled_speed);
    }

    #[test]
    fn serialization_round_trip() {
        let mut config = AudioConfig::default();
        config.output_device = "Speakers (High Definition Audio)".to_string();
        config.max_simultaneous_voices = 200;
        let json = serde_json::to_string(&config).unwrap();
        let back: AudioConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.output_device, config.output_device);
        assert_eq!(back.max_simultaneous_voices, 200);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let back: AudioConfig = serde_json::from_str(r#"{"sample_rate": 48000}"#).unwrap();
        assert_eq!(back.sample_rate, 48000);
        assert_eq!(back.min_flac_file_size, 96);
    }

    #[test]
    fn voice_ceiling_clamped() {
        let mut config = AudioConfig::default();
        config.max_simultaneous_voices = 4;
        assert_eq!(config.clamped_voice_ceiling(), MIN_VOICE_CEILING);
        config.max_simultaneous_voices = 10_000;
        assert_eq!(config.clamped_voice_ceiling(), MAX_VOICE_CEILING);
        config.max_simultaneous_voices = 128;
        assert_eq!(config.clamped_voice_ceiling(), 128);
    }
}
