//! Sample-rate conversion between the device rate and the wire rate.
//!
//! The hardware streams run at 48 kHz; the transport carries 16 kHz PCM.
//! Each direction of the call owns one `RateConverter`:
//!
//! - outbound: 48 kHz capture → 16 kHz before DSP and transmission
//! - inbound: 16 kHz network audio → 48 kHz before playback
//!
//! rubato's `FastFixedIn` with cubic interpolation handles both directions,
//! which gives anti-aliased decimation going down and better-than-linear
//! interpolation going up. Naive take-every-Nth / repeat-each-sample
//! conversion is deliberately absent: it aliases and buzzes.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{CallError, Result};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when input rate == output rate (passthrough mode).
    inner: Option<FastFixedIn<f32>>,
    /// Holds partial input between calls until rubato's fixed chunk fills.
    pending: Vec<f32>,
    /// Input samples rubato consumes per process call.
    chunk_len: usize,
    /// Pre-allocated rubato output: `[1][output_frames_max]`.
    scratch: Vec<Vec<f32>>,
}

impl RateConverter {
    /// Create a converter from `from_hz` to `to_hz`, fed `chunk_len` input
    /// samples at a time (one packet, e.g. 960 at 48 kHz or 320 at 16 kHz).
    ///
    /// # Errors
    /// Returns `CallError::Stream` if rubato rejects the configuration.
    pub fn new(from_hz: u32, to_hz: u32, chunk_len: usize) -> Result<Self> {
        if from_hz == to_hz {
            return Ok(Self {
                inner: None,
                pending: Vec::new(),
                chunk_len,
                scratch: Vec::new(),
            });
        }

        let ratio = to_hz as f64 / from_hz as f64;
        let inner = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio — no dynamic adjustment
            PolynomialDegree::Cubic,
            chunk_len,
            1, // mono
        )
        .map_err(|e| CallError::Stream(format!("resampler init: {e}")))?;

        let max_out = inner.output_frames_max();
        let scratch = vec![vec![0f32; max_out]; 1];

        Ok(Self {
            inner: Some(inner),
            pending: Vec::new(),
            chunk_len,
            scratch,
        })
    }

    /// Process incoming samples, returning converted output (may be empty
    /// while a partial chunk accumulates). Passthrough when rates match.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut inner) = self.inner else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);

        let mut out = Vec::new();
        while self.pending.len() >= self.chunk_len {
            let input = &self.pending[..self.chunk_len];
            match inner.process_into_buffer(&[input], &mut self.scratch, None) {
                Ok((_consumed, produced)) => {
                    out.extend_from_slice(&self.scratch[0][..produced]);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }
            self.pending.drain(..self.chunk_len);
        }
        out
    }

    /// Returns `true` when no conversion takes place.
    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }
}
