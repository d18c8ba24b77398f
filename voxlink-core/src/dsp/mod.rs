//! Outbound-path DSP: echo cancellation followed by a noise gate.
//!
//! The processor sits between the 48→16 kHz downsampler and the transport.
//! Two threads touch it — the playback pump feeds the echo reference, the
//! outbound pump processes capture frames — so it is shared through
//! [`DspHandle`], a `parking_lot::Mutex` wrapper. The lock covers pure
//! computation only, never device or network I/O.

pub mod echo;
pub mod gate;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::SessionConfig;

pub use echo::EchoCanceller;
pub use gate::NoiseGate;

/// Echo canceller + noise gate with one shared filter state per call.
pub struct DspProcessor {
    echo: EchoCanceller,
    gate: NoiseGate,
}

impl DspProcessor {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            echo: EchoCanceller::new(config.echo_taps, config.echo_learning_rate),
            gate: NoiseGate::new(config.gate_threshold, config.gate_ratio),
        }
    }

    /// Feed samples that are about to be played out (the echo reference).
    pub fn record_playback(&mut self, samples: &[f32]) {
        self.echo.push_reference(samples);
    }

    /// Suppress echo and background noise in a capture frame.
    pub fn process_capture(&mut self, mic: &[f32]) -> Vec<f32> {
        let mut out = self.echo.process(mic);
        self.gate.process(&mut out);
        out
    }

    /// Zero all filter state. Must run at the start of every call.
    pub fn reset(&mut self) {
        self.echo.reset();
    }

    // Runtime-adjustable parameters.

    pub fn set_learning_rate(&mut self, rate: f32) {
        self.echo.set_learning_rate(rate);
    }

    pub fn set_gate_threshold(&mut self, threshold: f32) {
        self.gate.set_threshold(threshold);
    }

    pub fn set_gate_ratio(&mut self, ratio: f32) {
        self.gate.set_ratio(ratio);
    }

    pub fn learning_rate(&self) -> f32 {
        self.echo.learning_rate()
    }
}

/// Thread-safe reference-counted handle to a [`DspProcessor`].
#[derive(Clone)]
pub struct DspHandle(pub Arc<Mutex<DspProcessor>>);

impl DspHandle {
    pub fn new(processor: DspProcessor) -> Self {
        Self(Arc::new(Mutex::new(processor)))
    }
}

impl std::fmt::Debug for DspHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DspHandle").finish_non_exhaustive()
    }
}
