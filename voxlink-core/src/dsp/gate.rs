//! Noise gate: attenuate samples below an amplitude threshold.

/// Per-sample dynamics processor. Samples with `|s| < threshold` are scaled
/// by `ratio`; everything else passes through unchanged.
#[derive(Debug, Clone)]
pub struct NoiseGate {
    threshold: f32,
    ratio: f32,
}

impl NoiseGate {
    pub fn new(threshold: f32, ratio: f32) -> Self {
        Self { threshold, ratio }
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    pub fn set_ratio(&mut self, ratio: f32) {
        self.ratio = ratio;
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn ratio(&self) -> f32 {
        self.ratio
    }

    pub fn process(&self, samples: &mut [f32]) {
        for s in samples {
            if s.abs() < self.threshold {
                *s *= self.ratio;
            }
        }
    }
}

impl Default for NoiseGate {
    fn default() -> Self {
        Self::new(0.02, 0.1)
    }
}
