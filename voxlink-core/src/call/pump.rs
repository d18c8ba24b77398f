//! The three audio pumps that run for the duration of a call.
//!
//! - **outbound**: mic → downsample → echo cancel + gate → transport, paced
//!   by a tokio interval at the packet cadence.
//! - **inbound**: transport audio channel → jitter buffer. Purely reactive.
//! - **playback**: jitter buffer → echo reference → upsample → speaker, on a
//!   blocking thread because the jitter read blocks on the ticker.
//!
//! All three watch the shared `running` flag and exit within roughly one
//! packet interval of it flipping false.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::{
    audio::{resample::RateConverter, AudioHandle, WavTap},
    config::SessionConfig,
    dsp::DspHandle,
    error::Result,
    jitter::JitterBuffer,
    transport::TransportClient,
};

use super::CallEvent;

/// Outbound ticks between audio-activity events (5 × 20 ms = 100 ms).
const ACTIVITY_EVERY_TICKS: u32 = 5;

/// Everything the pumps share with the orchestrator.
pub(crate) struct PumpContext {
    pub config: SessionConfig,
    pub audio: AudioHandle,
    pub dsp: DspHandle,
    pub jitter: Arc<JitterBuffer>,
    pub transport: Arc<TransportClient>,
    pub running: Arc<AtomicBool>,
    pub muted: Arc<AtomicBool>,
    pub events: broadcast::Sender<CallEvent>,
}

/// Spawn all pumps. Fails only if a resampler rejects its configuration,
/// which is checked before any task starts.
pub(crate) fn spawn_all(
    ctx: PumpContext,
    audio_rx: mpsc::Receiver<Vec<f32>>,
) -> Result<()> {
    let capture_converter = RateConverter::new(
        ctx.config.hardware_sample_rate,
        ctx.config.wire_sample_rate,
        ctx.config.hardware_frame_len(),
    )?;
    let playback_converter = RateConverter::new(
        ctx.config.wire_sample_rate,
        ctx.config.hardware_sample_rate,
        ctx.config.wire_frame_len(),
    )?;

    let (capture_tap, playback_tap) = open_taps(&ctx.config);

    spawn_outbound(&ctx, capture_converter, capture_tap);
    spawn_inbound(&ctx, audio_rx);
    spawn_playback(&ctx, playback_converter, playback_tap);
    Ok(())
}

/// Open WAV debug taps when a debug directory is configured. Tap failures
/// are logged and ignored; they must never block a call.
fn open_taps(config: &SessionConfig) -> (Option<WavTap>, Option<WavTap>) {
    let Some(dir) = &config.debug_audio_dir else {
        return (None, None);
    };
    let open = |name: &str| match WavTap::create(&dir.join(name), config.wire_sample_rate) {
        Ok(tap) => Some(tap),
        Err(e) => {
            warn!("debug tap {name} unavailable: {e}");
            None
        }
    };
    (open("capture.wav"), open("playback.wav"))
}

fn spawn_outbound(ctx: &PumpContext, mut converter: RateConverter, tap: Option<WavTap>) {
    let audio = ctx.audio.clone();
    let dsp = ctx.dsp.clone();
    let transport = Arc::clone(&ctx.transport);
    let running = Arc::clone(&ctx.running);
    let muted = Arc::clone(&ctx.muted);
    let events = ctx.events.clone();
    let hardware_frame = ctx.config.hardware_frame_len();
    let packet_ms = ctx.config.packet_ms;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(packet_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ticks: u32 = 0;

        while running.load(Ordering::Relaxed) {
            interval.tick().await;
            if !running.load(Ordering::Relaxed) {
                break;
            }

            let captured = audio.0.lock().read_capture(hardware_frame);
            let wire = converter.process(&captured);
            if wire.is_empty() {
                continue;
            }

            let frame = if muted.load(Ordering::Relaxed) {
                vec![0.0; wire.len()]
            } else {
                dsp.0.lock().process_capture(&wire)
            };

            if let Some(tap) = &tap {
                tap.write(&frame);
            }

            if transport.send_audio(&frame).await.is_err() {
                debug!("outbound pump: transport gone");
                break;
            }

            ticks = ticks.wrapping_add(1);
            if ticks % ACTIVITY_EVERY_TICKS == 0 {
                let (input_level, output_level) = {
                    let io = audio.0.lock();
                    (io.input_level(), io.output_level())
                };
                let _ = events.send(CallEvent::AudioActivity {
                    input_level,
                    output_level,
                });
            }
        }
        debug!("outbound pump stopped");
    });
}

fn spawn_inbound(ctx: &PumpContext, mut audio_rx: mpsc::Receiver<Vec<f32>>) {
    let jitter = Arc::clone(&ctx.jitter);
    let running = Arc::clone(&ctx.running);
    let recv_timeout = Duration::from_millis(ctx.config.packet_ms * 2);

    tokio::spawn(async move {
        while running.load(Ordering::Relaxed) {
            match tokio::time::timeout(recv_timeout, audio_rx.recv()).await {
                Ok(Some(frame)) => {
                    if !frame.is_empty() {
                        jitter.write_audio(frame);
                    }
                }
                Ok(None) => break, // transport read loop ended
                Err(_) => continue, // timeout: re-check running
            }
        }
        debug!("inbound pump stopped");
    });
}

fn spawn_playback(ctx: &PumpContext, mut converter: RateConverter, tap: Option<WavTap>) {
    let audio = ctx.audio.clone();
    let dsp = ctx.dsp.clone();
    let jitter = Arc::clone(&ctx.jitter);
    let running = Arc::clone(&ctx.running);
    let wire_frame = ctx.config.wire_frame_len();

    // The jitter read blocks on the ticker thread, so this pump must not sit
    // on a tokio worker.
    tokio::task::spawn_blocking(move || {
        while running.load(Ordering::Relaxed) {
            // Paced by the jitter ticker: one frame per packet interval,
            // silence on timeout.
            let frame = jitter.read_audio(wire_frame);

            // Everything about to hit the speaker is echo reference.
            dsp.0.lock().record_playback(&frame);

            if let Some(tap) = &tap {
                tap.write(&frame);
            }

            let upsampled = converter.process(&frame);
            if !upsampled.is_empty() {
                audio.0.lock().write_playback(&upsampled);
            }
        }
        debug!("playback pump stopped");
    });
}
