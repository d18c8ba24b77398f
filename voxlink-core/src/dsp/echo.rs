//! Adaptive acoustic echo cancellation.
//!
//! ## Algorithm
//!
//! Normalized least-mean-squares (NLMS) adaptive filter. A circular buffer
//! holds recently played-out speaker samples; a tap-weight vector of the
//! same order models the room's echo path. Per microphone sample:
//!
//! 1. `estimate = Σ_j weight[j] * reference[pos − j]`
//! 2. `error = mic − estimate` (the echo-suppressed output)
//! 3. `weight[j] += μ * error * reference[pos − j] / (‖ref‖² + ε)`
//!
//! The energy normalization keeps the update stable across loud and quiet
//! reference passages; μ (the learning rate) stays the tunable knob — too
//! high howls, too low adapts slowly.

/// Small constant keeping the NLMS divisor away from zero.
const EPSILON: f32 = 1e-6;

/// Extra reference history beyond the filter order. The ring must retain at
/// least one full packet of played-out audio so a whole microphone frame can
/// be aligned against it; a ring merely `taps` long would overwrite itself
/// mid-frame.
const FRAME_HEADROOM: usize = 512;

/// NLMS echo canceller over a mono 16 kHz signal.
pub struct EchoCanceller {
    /// Circular buffer of recently played-out samples.
    reference: Vec<f32>,
    /// Adaptive tap weights, same length as `reference`.
    weights: Vec<f32>,
    /// Next write position in `reference`.
    write_pos: usize,
    /// NLMS step size μ.
    learning_rate: f32,
}

impl EchoCanceller {
    /// `taps` is the filter order (128 ≈ 8 ms of echo path at 16 kHz).
    pub fn new(taps: usize, learning_rate: f32) -> Self {
        let taps = taps.max(1);
        Self {
            reference: vec![0.0; taps + FRAME_HEADROOM],
            weights: vec![0.0; taps],
            write_pos: 0,
            learning_rate,
        }
    }

    pub fn set_learning_rate(&mut self, rate: f32) {
        self.learning_rate = rate;
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Feed samples that are about to be played out of the speaker.
    pub fn push_reference(&mut self, samples: &[f32]) {
        let len = self.reference.len();
        for &s in samples {
            self.reference[self.write_pos] = s;
            self.write_pos = (self.write_pos + 1) % len;
        }
    }

    /// Cancel the echo estimate out of a microphone frame.
    ///
    /// `mic` is assumed to be time-aligned with the most recently pushed
    /// reference samples; packets arrive at the same 20 ms cadence in both
    /// directions, so the alignment error stays within the filter order.
    pub fn process(&mut self, mic: &[f32]) -> Vec<f32> {
        let len = self.reference.len();
        let taps = self.weights.len();
        let mut out = Vec::with_capacity(mic.len());

        // Walk the reference ring so mic[last] lines up with the newest
        // reference sample.
        let mut pos = (self.write_pos + len - mic.len().min(len)) % len;

        for &m in mic {
            let mut estimate = 0.0f32;
            let mut energy = 0.0f32;
            for j in 0..taps {
                let r = self.reference[(pos + len - j) % len];
                estimate += self.weights[j] * r;
                energy += r * r;
            }

            let error = m - estimate;
            let step = self.learning_rate * error / (energy + EPSILON);
            for j in 0..taps {
                let r = self.reference[(pos + len - j) % len];
                self.weights[j] += step * r;
            }

            out.push(error.clamp(-1.0, 1.0));
            pos = (pos + 1) % len;
        }
        out
    }

    /// Zero the reference buffer and tap weights. Call at every call start so
    /// stale state from the previous session cannot leak into a new one.
    pub fn reset(&mut self) {
        self.reference.fill(0.0);
        self.weights.fill(0.0);
        self.write_pos = 0;
    }
}
