//! Windowed overlap-add time stretch over interleaved samples.
//!
//! Sits between the decoder and the mix bus ring of a stream voice. Changes
//! playback rate without changing pitch by resampling grain positions: each
//! output grain overlaps its neighbor by half a window, while the analysis
//! position advances through the input at `speed` times the synthesis hop.
//!
//! The filter holds up to one window of not-yet-complete output, so its
//! output trails the decode head by a bounded latency that position
//! reporting has to subtract. See [`TimeStretch::latency_ms`].

use std::collections::VecDeque;
use std::f32::consts::PI;

/// Grain window duration. Short enough for transients, long enough that
/// low frequencies survive the windowing.
const WINDOW_MS: f64 = 40.0;
/// Speeds this close to 1.0 bypass the filter entirely.
const BYPASS_EPSILON: f64 = 1e-3;

pub struct TimeStretch {
    channels: usize,
    /// Grain length in frames, always even.
    window_frames: usize,
    /// Output advance per grain, half the window (Hann sums to unity there).
    synthesis_hop: usize,
    window: Vec<f32>,
    speed: f64,
    /// Fractional remainder of the analysis hop, carried between grains.
    hop_carry: f64,
    /// Pending decoded input, interleaved.
    input: VecDeque<f32>,
    /// Partially accumulated output, one window long, interleaved.
    overlap: Vec<f32>,
    /// Completed output frames, interleaved, ready to pull.
    output: VecDeque<f32>,
    sample_rate: u32,
}

impl TimeStretch {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        let mut window_frames = (sample_rate as f64 * WINDOW_MS / 1000.0) as usize;
        window_frames &= !1;
        let window_frames = window_frames.max(64);
        let window = (0..window_frames)
            .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f32 / window_frames as f32).cos())
            .collect();
        Self {
            channels,
            window_frames,
            synthesis_hop: window_frames / 2,
            window,
            speed: 1.0,
            hop_carry: 0.0,
            input: VecDeque::new(),
            overlap: vec![0.0; window_frames * channels],
            output: VecDeque::new(),
            sample_rate,
        }
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Change the stretch factor. Flushes grain state, which produces a
    /// short discontinuity; callers only change speed on explicit requests.
    pub fn set_speed(&mut self, speed: f64) {
        if (speed - self.speed).abs() < f64::EPSILON {
            return;
        }
        self.speed = speed;
        self.hop_carry = 0.0;
        self.overlap.iter_mut().for_each(|s| *s = 0.0);
    }

    fn bypass(&self) -> bool {
        (self.speed - 1.0).abs() < BYPASS_EPSILON
    }

    /// Feed interleaved decoded samples.
    pub fn push(&mut self, interleaved: &[f32]) {
        if self.bypass() && self.input.is_empty() {
            self.output.extend(interleaved.iter().copied());
            return;
        }
        self.input.extend(interleaved.iter().copied());
        self.run_grains();
    }

    /// Move all completed output into `out`.
    pub fn pull(&mut self, out: &mut Vec<f32>) {
        out.extend(self.output.drain(..));
    }

    /// Completed frames waiting to be pulled.
    pub fn available_frames(&self) -> usize {
        self.output.len() / self.channels
    }

    /// Worst-case delay between the decode head and the filter output.
    pub fn latency_ms(&self) -> f64 {
        if self.bypass() {
            0.0
        } else {
            self.window_frames as f64 * 1000.0 / self.sample_rate as f64
        }
    }

    /// Drop all buffered audio. Used when the decode context is rebuilt.
    pub fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
        self.overlap.iter_mut().for_each(|s| *s = 0.0);
        self.hop_carry = 0.0;
    }

    fn run_grains(&mut self) {
        let ch = self.channels;
        while self.input.len() >= self.window_frames * ch {
            // accumulate one windowed grain
            for frame in 0..self.window_frames {
                let w = self.window[frame];
                for c in 0..ch {
                    self.overlap[frame * ch + c] += self.input[frame * ch + c] * w;
                }
            }

            // the first half of the accumulator is now fully overlapped
            let done = self.synthesis_hop * ch;
            self.output.extend(self.overlap[..done].iter().copied());
            self.overlap.copy_within(done.., 0);
            let tail_start = self.overlap.len() - done;
            self.overlap[tail_start..].iter_mut().for_each(|s| *s = 0.0);

            // advance the analysis position through the input
            let exact_hop = self.synthesis_hop as f64 * self.speed + self.hop_carry;
            let hop_frames = exact_hop as usize;
            self.hop_carry = exact_hop - hop_frames as f64;
            let drop = (hop_frames * ch).min(self.input.len());
            self.input.drain(..drop);
        }
    }
}
