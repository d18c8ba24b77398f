//! Local audio I/O: duplex capture + playback streams over cpal.
//!
//! # Design constraints
//!
//! The cpal callbacks run on OS audio threads at elevated priority. They
//! **must not** block on anything slower than the `SampleRing` mutex, perform
//! I/O, or allocate unboundedly. Both callbacks only move samples between
//! the hardware buffers and a ring, plus one RMS store into an atomic.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `AudioStream::start` therefore opens both streams on a dedicated
//! worker thread that also drops them, and reports open success/failure back
//! through a sync channel.

pub mod device;
pub mod resample;

use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::{error, info};

use crate::{
    buffering::SampleRing,
    config::SessionConfig,
    error::{CallError, Result},
};

/// Ring capacity per direction: 2 s at 48 kHz. Big enough to ride out pump
/// scheduling hiccups, small enough that a stalled consumer only ever throws
/// away stale audio.
const RING_CAPACITY: usize = 96_000;

/// The seam between the call orchestrator and real hardware.
///
/// The cpal-backed [`AudioStream`] is the production implementor; tests use
/// in-memory stubs so the call state machine runs without any audio devices.
pub trait AudioIo: Send + 'static {
    /// Acquire devices and start both directions.
    ///
    /// # Errors
    /// Fails if already running or if device acquisition fails.
    fn start(&mut self) -> Result<()>;

    /// Release both devices. Safe to call multiple times.
    fn stop(&mut self);

    /// `true` between a successful `start()` and the next `stop()`.
    fn is_running(&self) -> bool;

    /// Pull up to `n` captured samples; missing tail is zero-filled.
    fn read_capture(&self, n: usize) -> Vec<f32>;

    /// Queue samples for playback.
    fn write_playback(&self, samples: &[f32]);

    /// RMS level of recent captured audio, clamped to [0, 1].
    fn input_level(&self) -> f32;

    /// RMS level of recent played audio, clamped to [0, 1].
    fn output_level(&self) -> f32;
}

/// Thread-safe shared handle to any [`AudioIo`] implementor.
#[derive(Clone)]
pub struct AudioHandle(pub Arc<Mutex<dyn AudioIo>>);

impl AudioHandle {
    pub fn new<A: AudioIo>(io: A) -> Self {
        Self(Arc::new(Mutex::new(io)))
    }
}

impl std::fmt::Debug for AudioHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioHandle").finish_non_exhaustive()
    }
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt().clamp(0.0, 1.0)
}

/// cpal-backed duplex audio stream at a fixed sample rate.
pub struct AudioStream {
    input_device: String,
    output_device: String,
    sample_rate: u32,
    capture_ring: SampleRing,
    playback_ring: SampleRing,
    running: Arc<AtomicBool>,
    /// RMS levels stored as f32 bit patterns (callbacks cannot lock-and-wait).
    input_level: Arc<AtomicU32>,
    output_level: Arc<AtomicU32>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl AudioStream {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            input_device: config.input_device.clone(),
            output_device: config.output_device.clone(),
            sample_rate: config.hardware_sample_rate,
            capture_ring: SampleRing::new(RING_CAPACITY),
            playback_ring: SampleRing::new(RING_CAPACITY),
            running: Arc::new(AtomicBool::new(false)),
            input_level: Arc::new(AtomicU32::new(0)),
            output_level: Arc::new(AtomicU32::new(0)),
            worker: None,
        }
    }

    /// Number of captured samples waiting to be read.
    pub fn buffered_capture(&self) -> usize {
        self.capture_ring.available()
    }

    /// Number of queued playback samples not yet sent to the device.
    pub fn buffered_playback(&self) -> usize {
        self.playback_ring.available()
    }
}

#[cfg(feature = "audio-cpal")]
mod cpal_backend {
    use super::*;

    use cpal::traits::{DeviceTrait, StreamTrait};
    use cpal::{SampleFormat, SampleRate, Stream, StreamConfig};

    pub(super) struct OpenStreams {
        pub input: Stream,
        pub output: Stream,
    }

    pub(super) fn open_streams(
        input_name: &str,
        output_name: &str,
        sample_rate: u32,
        capture_ring: SampleRing,
        playback_ring: SampleRing,
        running: Arc<AtomicBool>,
        input_level: Arc<AtomicU32>,
        output_level: Arc<AtomicU32>,
    ) -> Result<OpenStreams> {
        let input_device = device::find_input_device(input_name)?;
        let output_device = device::find_output_device(output_name)?;

        info!(
            input = input_device.name().unwrap_or_default().as_str(),
            output = output_device.name().unwrap_or_default().as_str(),
            sample_rate,
            "opening audio devices"
        );

        let input = build_input(
            &input_device,
            sample_rate,
            capture_ring,
            Arc::clone(&running),
            input_level,
        )?;
        let output = build_output(
            &output_device,
            sample_rate,
            playback_ring,
            running,
            output_level,
        )?;

        input
            .play()
            .map_err(|e| CallError::Stream(e.to_string()))?;
        output
            .play()
            .map_err(|e| CallError::Stream(e.to_string()))?;

        Ok(OpenStreams { input, output })
    }

    fn build_input(
        device: &cpal::Device,
        sample_rate: u32,
        ring: SampleRing,
        running: Arc<AtomicBool>,
        level: Arc<AtomicU32>,
    ) -> Result<Stream> {
        let supported = device
            .default_input_config()
            .map_err(|e| CallError::Device(e.to_string()))?;
        let channels = supported.channels();
        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let ch = channels as usize;

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let mut mono: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        let frames = data.len() / ch;
                        mono.resize(frames, 0.0);
                        if ch == 1 {
                            mono.copy_from_slice(&data[..frames]);
                        } else {
                            for f in 0..frames {
                                let base = f * ch;
                                let mut sum = 0f32;
                                for c in 0..ch {
                                    sum += data[base + c];
                                }
                                mono[f] = sum / ch as f32;
                            }
                        }
                        level.store(rms(&mono).to_bits(), Ordering::Relaxed);
                        ring.write(&mono);
                    },
                    |err| error!("input stream error: {err}"),
                    None,
                )
            }
            SampleFormat::I16 => {
                let mut mono: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        let frames = data.len() / ch;
                        mono.resize(frames, 0.0);
                        for f in 0..frames {
                            let base = f * ch;
                            let mut sum = 0f32;
                            for c in 0..ch {
                                sum += data[base + c] as f32 / 32768.0;
                            }
                            mono[f] = sum / ch as f32;
                        }
                        level.store(rms(&mono).to_bits(), Ordering::Relaxed);
                        ring.write(&mono);
                    },
                    |err| error!("input stream error: {err}"),
                    None,
                )
            }
            fmt => {
                return Err(CallError::Stream(format!(
                    "unsupported input sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| CallError::Stream(e.to_string()))?;

        Ok(stream)
    }

    fn build_output(
        device: &cpal::Device,
        sample_rate: u32,
        ring: SampleRing,
        running: Arc<AtomicBool>,
        level: Arc<AtomicU32>,
    ) -> Result<Stream> {
        let supported = device
            .default_output_config()
            .map_err(|e| CallError::Device(e.to_string()))?;
        let channels = supported.channels();
        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let ch = channels as usize;

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let mut mono: Vec<f32> = Vec::new();
                device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _info| {
                        let frames = data.len() / ch;
                        mono.resize(frames, 0.0);
                        if running.load(Ordering::Relaxed) {
                            ring.read_into(&mut mono);
                        } else {
                            mono.fill(0.0);
                        }
                        level.store(rms(&mono).to_bits(), Ordering::Relaxed);
                        for f in 0..frames {
                            let base = f * ch;
                            for c in 0..ch {
                                data[base + c] = mono[f];
                            }
                        }
                    },
                    |err| error!("output stream error: {err}"),
                    None,
                )
            }
            SampleFormat::I16 => {
                let mut mono: Vec<f32> = Vec::new();
                device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _info| {
                        let frames = data.len() / ch;
                        mono.resize(frames, 0.0);
                        if running.load(Ordering::Relaxed) {
                            ring.read_into(&mut mono);
                        } else {
                            mono.fill(0.0);
                        }
                        level.store(rms(&mono).to_bits(), Ordering::Relaxed);
                        for f in 0..frames {
                            let base = f * ch;
                            let sample = (mono[f].clamp(-1.0, 1.0) * 32767.0) as i16;
                            for c in 0..ch {
                                data[base + c] = sample;
                            }
                        }
                    },
                    |err| error!("output stream error: {err}"),
                    None,
                )
            }
            fmt => {
                return Err(CallError::Stream(format!(
                    "unsupported output sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| CallError::Stream(e.to_string()))?;

        Ok(stream)
    }
}

impl AudioIo for AudioStream {
    #[cfg(feature = "audio-cpal")]
    fn start(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CallError::AlreadyRunning);
        }

        let input_name = self.input_device.clone();
        let output_name = self.output_device.clone();
        let sample_rate = self.sample_rate;
        let capture_ring = self.capture_ring.clone();
        let playback_ring = self.playback_ring.clone();
        let running = Arc::clone(&self.running);
        let input_level = Arc::clone(&self.input_level);
        let output_level = Arc::clone(&self.output_level);

        // Sync channel: the worker reports open success/failure back here.
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<()>>();

        let worker = std::thread::Builder::new()
            .name("voxlink-audio".into())
            .spawn(move || {
                // Streams must be created and dropped on this thread.
                let streams = match cpal_backend::open_streams(
                    &input_name,
                    &output_name,
                    sample_rate,
                    capture_ring,
                    playback_ring,
                    Arc::clone(&running),
                    input_level,
                    output_level,
                ) {
                    Ok(s) => {
                        let _ = open_tx.send(Ok(()));
                        s
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        running.store(false, Ordering::SeqCst);
                        return;
                    }
                };

                while running.load(Ordering::Relaxed) {
                    std::thread::sleep(std::time::Duration::from_millis(20));
                }
                drop(streams);
                info!("audio devices released");
            })
            .map_err(|e| CallError::Stream(format!("audio worker spawn: {e}")))?;

        match open_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(worker);
                info!("audio stream running");
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = worker.join();
                Err(CallError::Stream("audio worker died during open".into()))
            }
        }
    }

    #[cfg(not(feature = "audio-cpal"))]
    fn start(&mut self) -> Result<()> {
        Err(CallError::Stream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.capture_ring.clear();
        self.playback_ring.clear();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn read_capture(&self, n: usize) -> Vec<f32> {
        self.capture_ring.read(n)
    }

    fn write_playback(&self, samples: &[f32]) {
        self.playback_ring.write(samples);
    }

    fn input_level(&self) -> f32 {
        f32::from_bits(self.input_level.load(Ordering::Relaxed))
    }

    fn output_level(&self) -> f32 {
        f32::from_bits(self.output_level.load(Ordering::Relaxed))
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Debug tap writing mono f32 pipeline audio to a 16-bit WAV file.
///
/// Not part of the live audio path; pump loops call `write` opportunistically
/// when a tap is configured. Dropping the tap finalizes the file.
pub struct WavTap {
    writer: Mutex<Option<hound::WavWriter<std::io::BufWriter<std::fs::File>>>>,
}

impl WavTap {
    pub fn create(path: &Path, sample_rate: u32) -> Result<Self> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path, spec)
            .map_err(|e| CallError::Io(std::io::Error::other(e.to_string())))?;
        Ok(Self {
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn write(&self, samples: &[f32]) {
        if let Some(writer) = self.writer.lock().as_mut() {
            for s in samples {
                let q = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
                if let Err(e) = writer.write_sample(q) {
                    error!("wav tap write failed: {e}");
                    return;
                }
            }
        }
    }

    pub fn finalize(&self) {
        if let Some(writer) = self.writer.lock().take() {
            if let Err(e) = writer.finalize() {
                error!("wav tap finalize failed: {e}");
            }
        }
    }
}

impl Drop for WavTap {
    fn drop(&mut self) {
        self.finalize();
    }
}
