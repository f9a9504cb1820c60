/// Minimum wall-clock gap before a new raw reading updates the rate estimate.
const MIN_RATE_SAMPLE_SECS: f64 = 0.005;
/// Raw position considered stale after this long without a change.
const STALE_READING_SECS: f64 = 0.1;
/// Allowed deviation of the instantaneous rate from the nominal rate.
const RATE_DEVIATION_BAND: f64 = 0.2;
/// Blend weight pulling an implausible instantaneous rate back toward nominal.
const DEVIATION_BLEND_NOMINAL: f64 = 0.7;
/// Exponential smoothing weight kept from the previous rate estimate.
const RATE_SMOOTHING_OLD: f64 = 0.6;
/// Relaxation weight kept when the raw position has gone stale.
const STALE_RELAX_OLD: f64 = 0.95;

/// Smooths the coarse, irregular position readouts of an audio backend into a
/// per-frame position estimate.
///
/// Backends typically update their reported position only every buffer or
/// decode block, so reading it every frame produces a staircase. This tracker
/// estimates the effective playback rate (milliseconds of audio per wall-clock
/// second) from successive raw readings and extrapolates between them.
///
/// Not thread-safe by design: update and reset are main-thread only.
#[derive(Debug, Clone)]
pub struct PlaybackInterpolator {
    /// Last raw position reported by the backend, in milliseconds.
    last_raw_ms: f64,
    /// Wall-clock time (seconds) when `last_raw_ms` was obtained; <= 0 means uninitialized.
    last_raw_time: f64,
    /// Estimated playback rate in ms of audio per wall-clock second.
    estimated_rate: f64,
    /// Last value returned by `update`.
    last_output_ms: u32,
}

impl Default for PlaybackInterpolator {
    fn default() -> Self {
        Self {
            last_raw_ms: 0.0,
            last_raw_time: 0.0,
            estimated_rate: 1000.0,
            last_output_ms: 0,
        }
    }
}

impl PlaybackInterpolator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the current raw backend position and get the smoothed position.
    ///
    /// Call every frame. `current_time` is wall-clock seconds, `speed` is the
    /// requested playback speed multiplier, `length_ms` is required for loop
    /// wraparound handling.
    pub fn update(
        &mut self,
        raw_position_ms: f64,
        current_time: f64,
        speed: f64,
        is_looped: bool,
        length_ms: u64,
        is_playing: bool,
    ) -> u32 {
        if self.last_raw_time <= 0.0 || !is_playing {
            self.reset(raw_position_ms, current_time, speed);
            return self.last_output_ms;
        }

        let nominal_rate = 1000.0 * speed;

        if self.last_raw_ms != raw_position_ms {
            let time_delta = current_time - self.last_raw_time;

            if time_delta > MIN_RATE_SAMPLE_SECS {
                let mut new_rate = if raw_position_ms >= self.last_raw_ms {
                    (raw_position_ms - self.last_raw_ms) / time_delta
                } else if is_looped && length_ms > 0 {
                    // backward jump on a looped track: treat as wraparound
                    let wrapped = (length_ms as f64 - self.last_raw_ms) + raw_position_ms;
                    wrapped / time_delta
                } else {
                    // explicit seek: keep the current rate, trust the next forward reading
                    self.estimated_rate
                };

                if new_rate < nominal_rate * (1.0 - RATE_DEVIATION_BAND)
                    || new_rate > nominal_rate * (1.0 + RATE_DEVIATION_BAND)
                {
                    new_rate =
                        nominal_rate * DEVIATION_BLEND_NOMINAL + new_rate * (1.0 - DEVIATION_BLEND_NOMINAL);
                }

                self.estimated_rate =
                    self.estimated_rate * RATE_SMOOTHING_OLD + new_rate * (1.0 - RATE_SMOOTHING_OLD);
            }

            self.last_raw_ms = raw_position_ms;
            self.last_raw_time = current_time;
        } else {
            // sparse backend updates: drift the estimate toward nominal
            let time_since_change = current_time - self.last_raw_time;
            if time_since_change > STALE_READING_SECS {
                self.estimated_rate =
                    self.estimated_rate * STALE_RELAX_OLD + nominal_rate * (1.0 - STALE_RELAX_OLD);
            }
        }

        let elapsed = current_time - self.last_raw_time;
        let interpolated = self.last_raw_ms + elapsed * self.estimated_rate;

        if is_looped && length_ms > 0 {
            let length = length_ms as f64;
            if interpolated >= length {
                self.last_output_ms = (interpolated % length) as u32;
                return self.last_output_ms;
            }
        }

        self.last_output_ms = interpolated.max(0.0) as u32;
        self.last_output_ms
    }

    /// Discard rate history and snap to the given raw position.
    ///
    /// Call on every seek and on playback (re)start.
    pub fn reset(&mut self, raw_position_ms: f64, current_time: f64, speed: f64) {
        self.last_raw_ms = raw_position_ms;
        self.last_raw_time = current_time;
        self.estimated_rate = 1000.0 * speed;
        self.last_output_ms = raw_position_ms.max(0.0) as u32;
    }

    /// Last value returned by `update`, without advancing state.
    pub fn last_position_ms(&self) -> u32 {
        self.last_output_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Simulate a backend that updates its raw readout every `update_interval`
    /// seconds while the caller polls every `poll_interval` seconds.
    fn run_simulation(
        interp: &mut PlaybackInterpolator,
        start_ms: f64,
        duration_secs: f64,
        speed: f64,
        poll_interval: f64,
        update_interval: f64,
    ) -> Vec<u32> {
        let mut outputs = Vec::new();
        let mut t = 1.0;
        let end = t + duration_secs;
        let mut last_backend_update = t;
        let mut raw = start_ms;
        interp.reset(raw, t, speed);
        while t < end {
            t += poll_interval;
            if t - last_backend_update >= update_interval {
                raw += (t - last_backend_update) * 1000.0 * speed;
                last_backend_update = t;
            }
            outputs.push(interp.update(raw, t, speed, false, 600_000, true));
        }
        outputs
    }

    #[test]
    fn resets_verbatim_when_not_playing() {
        let mut interp = PlaybackInterpolator::new();
        let pos = interp.update(1234.0, 10.0, 1.0, false, 10_000, false);
        assert_eq!(pos, 1234);
        assert_eq!(interp.last_position_ms(), 1234);
    }

    #[test]
    fn first_update_is_verbatim() {
        let mut interp = PlaybackInterpolator::new();
        // uninitialized state snaps to the raw reading
        let pos = interp.update(500.0, 3.0, 1.0, false, 10_000, true);
        assert_eq!(pos, 500);
    }

    #[test]
    fn tracks_double_speed() {
        // 10s stream at 2x: after 1s of wall time we should be near 2000ms
        let mut interp = PlaybackInterpolator::new();
        let outputs = run_simulation(&mut interp, 0.0, 1.0, 2.0, 1.0 / 60.0, 0.05);
        let last = *outputs.last().unwrap() as f64;
        assert!(
            (last - 2000.0).abs() < 100.0,
            "expected ~2000ms, got {last}"
        );
    }

    #[test]
    fn smooth_between_sparse_updates() {
        // backend only updates every 100ms; the output should still advance
        // every frame instead of producing a staircase
        let mut interp = PlaybackInterpolator::new();
        let outputs = run_simulation(&mut interp, 0.0, 2.0, 1.0, 1.0 / 60.0, 0.1);
        let stalls = outputs
            .windows(2)
            .filter(|w| w[1] == w[0])
            .count();
        assert!(
            stalls < outputs.len() / 4,
            "too many stalled frames: {stalls}/{}",
            outputs.len()
        );
    }

    #[test]
    fn loop_wrap_drops_once_and_stays_in_bounds() {
        let mut interp = PlaybackInterpolator::new();
        let length = 5_000u64;
        interp.reset(4800.0, 1.0, 1.0);
        let a = interp.update(4900.0, 1.1, 1.0, true, length, true);
        assert!(a <= length as u32);
        // raw wraps 5000 -> 200
        let b = interp.update(200.0, 1.4, 1.0, true, length, true);
        assert!(b <= length as u32, "wrapped output {b} exceeds length");
        assert!(b < a, "output should drop across the wrap ({a} -> {b})");
        // and keeps advancing normally afterwards
        let c = interp.update(300.0, 1.5, 1.0, true, length, true);
        assert!(c <= length as u32);
    }

    #[test]
    fn backward_seek_keeps_prior_rate() {
        let mut interp = PlaybackInterpolator::new();
        interp.reset(8000.0, 1.0, 1.0);
        interp.update(8100.0, 1.1, 1.0, false, 10_000, true);
        let rate_before = interp.estimated_rate;
        // non-looped backward jump: a seek, not a wrap
        interp.update(1000.0, 1.2, 1.0, false, 10_000, true);
        let deviation = (interp.estimated_rate - rate_before).abs() / rate_before;
        assert!(deviation < 0.5, "rate estimate jumped on seek: {deviation}");
    }

    #[test]
    fn implausible_rate_is_clamped_toward_nominal() {
        let mut interp = PlaybackInterpolator::new();
        interp.reset(0.0, 1.0, 1.0);
        // raw claims 10x speed over 10ms; estimate must stay near 1000 ms/s
        interp.update(100.0, 1.01, 1.0, false, 10_000, true);
        assert!(
            interp.estimated_rate < 2500.0,
            "estimate ran away: {}",
            interp.estimated_rate
        );
    }

    #[test]
    fn stale_readout_relaxes_toward_nominal() {
        let mut interp = PlaybackInterpolator::new();
        interp.reset(0.0, 1.0, 1.0);
        // skew the estimate upward with an implausible jump first
        interp.update(100.0, 1.01, 1.0, false, 10_000, true);
        let skewed = interp.estimated_rate;
        assert!(skewed > 1500.0);
        // then hold the raw position fixed well past the staleness threshold
        for i in 0..100 {
            interp.update(100.0, 1.2 + i as f64 * 0.05, 1.0, false, 10_000, true);
        }
        let deviation = (interp.estimated_rate - 1000.0).abs();
        assert!(deviation < 50.0, "rate did not relax: {}", interp.estimated_rate);
    }

    #[test]
    fn never_negative() {
        let mut interp = PlaybackInterpolator::new();
        interp.reset(0.0, 1.0, 1.0);
        let pos = interp.update(0.0, 1.001, 1.0, false, 10_000, true);
        assert_eq!(pos, 0);
    }

    proptest! {
        /// While playing forward without seeks, output never decreases.
        #[test]
        fn monotonic_without_seeks(
            speed in 0.5f64..4.0,
            update_interval in 0.02f64..0.2,
        ) {
            let mut interp = PlaybackInterpolator::new();
            let outputs = run_simulation(&mut interp, 0.0, 3.0, speed, 1.0 / 60.0, update_interval);
            for w in outputs.windows(2) {
                prop_assert!(w[1] >= w[0], "position went backwards: {} -> {}", w[0], w[1]);
            }
        }

        /// Looped playback output always stays within [0, length].
        #[test]
        fn looped_output_in_bounds(start in 0.0f64..4999.0, step in 10.0f64..400.0) {
            let mut interp = PlaybackInterpolator::new();
            let length = 5_000u64;
            let mut raw = start;
            let mut t = 1.0;
            interp.reset(raw, t, 1.0);
            for _ in 0..200 {
                t += 0.016;
                raw += step * 0.016;
                if raw >= length as f64 {
                    raw -= length as f64;
                }
                let out = interp.update(raw, t, 1.0, true, length, true);
                prop_assert!(out <= length as u32);
            }
        }
    }
}
