//! Cheap magic-byte validation for audio files.
//!
//! Some native decoders crash or hang on malformed files, so every load runs
//! this sniff before the backend ever sees the path. It is intentionally
//! permissive: the goal is to reject garbage (truncated downloads, renamed
//! text files), not to fully validate containers.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::AudioConfig;

/// How many bytes of the file header the sniff is allowed to inspect.
const WAV_SCAN_WINDOW: usize = 512;
const OGG_SCAN_WINDOW: usize = 1024;
const FLAC_SCAN_WINDOW: usize = 1024;
/// Smallest possible FLAC file (fLaC marker + STREAMINFO block).
const FLAC_ABSOLUTE_MIN_SIZE: u64 = 96;

/// Audio container formats recognized by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Mp3,
    Ogg,
    Flac,
}

impl AudioFormat {
    /// Map a file extension (case-insensitive) to a format.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "wav" | "wave" => Some(Self::Wav),
            "mp3" => Some(Self::Mp3),
            "ogg" => Some(Self::Ogg),
            "flac" => Some(Self::Flac),
            _ => None,
        }
    }

    /// Format for a path, from its extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}

/// Outcome of sniffing one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffVerdict {
    /// Header looks like the claimed format; hand it to the backend.
    Accept(AudioFormat),
    /// Unknown extension, undersized, or wrong magic; skip without error.
    Reject(RejectReason),
}

/// Why a file failed the sniff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownExtension,
    Undersized,
    BadMagic,
}

/// Sniff a file on disk against the thresholds in `config`.
///
/// I/O errors (file missing, unreadable) are real errors; a readable file
/// that merely fails validation yields `SniffVerdict::Reject`.
pub fn sniff_file(path: &Path, config: &AudioConfig) -> Result<SniffVerdict> {
    let Some(format) = AudioFormat::from_path(path) else {
        return Ok(SniffVerdict::Reject(RejectReason::UnknownExtension));
    };

    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let size = file
        .metadata()
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();

    let mut header = [0u8; OGG_SCAN_WINDOW];
    let mut read_total = 0usize;
    // short files are allowed; read as much header as exists
    while read_total < header.len() {
        let n = file.read(&mut header[read_total..])?;
        if n == 0 {
            break;
        }
        read_total += n;
    }

    Ok(sniff_header(format, &header[..read_total], size, config))
}

/// Pure sniff over an in-memory header slice.
pub fn sniff_header(
    format: AudioFormat,
    header: &[u8],
    file_size: u64,
    config: &AudioConfig,
) -> SniffVerdict {
    let min_size = match format {
        AudioFormat::Wav => config.min_wav_file_size,
        AudioFormat::Mp3 => config.min_mp3_file_size,
        AudioFormat::Ogg => config.min_ogg_file_size,
        AudioFormat::Flac => config.min_flac_file_size,
    };
    if file_size < min_size {
        return SniffVerdict::Reject(RejectReason::Undersized);
    }

    let ok = match format {
        AudioFormat::Wav => sniff_wav(header),
        AudioFormat::Mp3 => sniff_mp3(header),
        AudioFormat::Ogg => find_marker(header, b"OggS", OGG_SCAN_WINDOW),
        AudioFormat::Flac => {
            file_size >= FLAC_ABSOLUTE_MIN_SIZE && find_marker(header, b"fLaC", FLAC_SCAN_WINDOW)
        }
    };

    if ok {
        SniffVerdict::Accept(format)
    } else {
        SniffVerdict::Reject(RejectReason::BadMagic)
    }
}

/// "RIFF" with "WAVE" 8 bytes later, anywhere in the first 512 bytes.
///
/// The offset scan tolerates junk prefixes that some exporters leave in
/// front of the RIFF chunk.
fn sniff_wav(header: &[u8]) -> bool {
    let window = header.len().min(WAV_SCAN_WINDOW);
    if window < 12 {
        return false;
    }
    for i in 0..=(window - 12) {
        if &header[i..i + 4] == b"RIFF" && &header[i + 8..i + 12] == b"WAVE" {
            return true;
        }
    }
    false
}

/// An ID3 tag at offset 0 is proof enough; anything else that passed the
/// size threshold is accepted permissively (raw MPEG frames have no fixed
/// file-level magic).
fn sniff_mp3(header: &[u8]) -> bool {
    if header.len() >= 3 && &header[..3] == b"ID3" {
        return true;
    }
    !header.is_empty()
}

fn find_marker(header: &[u8], marker: &[u8], window: usize) -> bool {
    let window = header.len().min(window);
    if window < marker.len() {
        return false;
    }
    header[..window]
        .windows(marker.len())
        .any(|w| w == marker)
}
