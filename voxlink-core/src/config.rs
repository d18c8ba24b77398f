//! Session configuration.
//!
//! One `SessionConfig` is built by the embedding application (CLI, TUI, …)
//! and passed by reference into the orchestrator constructor. There are no
//! process-wide singletons; two orchestrators with different configs can
//! coexist in one process.

use std::path::PathBuf;

/// Everything a call session needs to know up front.
///
/// All DSP and jitter values are empirically chosen defaults, exposed so
/// they can be calibrated against real hardware at runtime.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL of the REST API used to create/terminate calls.
    pub api_base_url: String,
    /// Bearer token for the REST API.
    pub api_key: String,
    /// Input device name. `""` or `"default"` selects the platform default;
    /// otherwise exact match first, then case-insensitive substring.
    pub input_device: String,
    /// Output device name, resolved the same way as `input_device`.
    pub output_device: String,
    /// Sample rate the local hardware streams run at (Hz). Default: 48000.
    pub hardware_sample_rate: u32,
    /// Sample rate of the wire protocol (Hz). Default: 16000.
    pub wire_sample_rate: u32,
    /// Packet interval in both directions (ms). Default: 20.
    pub packet_ms: u64,
    /// Echo canceller filter length in taps. Default: 128.
    pub echo_taps: usize,
    /// Echo canceller learning rate. Too high diverges (howling), too low
    /// adapts slowly. Default: 0.01.
    pub echo_learning_rate: f32,
    /// Noise gate amplitude threshold. Default: 0.02.
    pub gate_threshold: f32,
    /// Attenuation applied below the gate threshold. Default: 0.1.
    pub gate_ratio: f32,
    /// Jitter buffer minimum target delay (ms). Default: 40.
    pub jitter_min_delay_ms: u64,
    /// Jitter buffer initial target delay (ms). Default: 60.
    pub jitter_start_delay_ms: u64,
    /// Jitter buffer maximum target delay (ms). Default: 200.
    pub jitter_max_delay_ms: u64,
    /// When set, raw capture/playback PCM is recorded as WAV files here.
    pub debug_audio_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.vapi.ai".into(),
            api_key: String::new(),
            input_device: "default".into(),
            output_device: "default".into(),
            hardware_sample_rate: 48_000,
            wire_sample_rate: 16_000,
            packet_ms: 20,
            echo_taps: 128,
            echo_learning_rate: 0.01,
            gate_threshold: 0.02,
            gate_ratio: 0.1,
            jitter_min_delay_ms: 40,
            jitter_start_delay_ms: 60,
            jitter_max_delay_ms: 200,
            debug_audio_dir: None,
        }
    }
}

impl SessionConfig {
    /// Samples per packet at the hardware rate (e.g. 960 at 48 kHz / 20 ms).
    pub fn hardware_frame_len(&self) -> usize {
        (self.hardware_sample_rate as u64 * self.packet_ms / 1000) as usize
    }

    /// Samples per packet at the wire rate (e.g. 320 at 16 kHz / 20 ms).
    pub fn wire_frame_len(&self) -> usize {
        (self.wire_sample_rate as u64 * self.packet_ms / 1000) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_frame_lengths_match_20ms_packets() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.hardware_frame_len(), 960);
        assert_eq!(cfg.wire_frame_len(), 320);
    }
}
