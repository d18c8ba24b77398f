//! Call lifecycle orchestration.
//!
//! The orchestrator owns one call at a time and drives it through:
//!
//! ```text
//! Idle → Connecting → Connected → Disconnected (remote close)
//!               ↘ Failed                 ↘ Idle (end_call)
//! ```
//!
//! `start_call` provisions the call over REST, dials the WebSocket, starts
//! local audio, and spawns the pumps. Failures at any step roll back what
//! was already set up and land in `Failed`. `end_call` tears everything down
//! in the reverse order and always returns to `Idle`, even after a partial
//! setup or a remote disconnect.

mod pump;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    audio::{AudioHandle, AudioStream},
    config::SessionConfig,
    dsp::{DspHandle, DspProcessor},
    error::{CallError, Result},
    jitter::{JitterBuffer, JitterConfig, JitterStats},
    rest::RestClient,
    transport::{SignalingEvent, TransportClient},
};

use pump::PumpContext;

/// Status event fan-out capacity.
const EVENT_CHANNEL_CAP: usize = 64;

/// Where the call currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Idle,
    Connecting,
    Connected,
    /// The remote side closed or the socket failed; local resources are
    /// still held until `end_call`.
    Disconnected,
    Failed,
}

/// Snapshot of the current call.
#[derive(Debug, Clone)]
pub struct CallState {
    pub status: CallStatus,
    pub call_id: Option<String>,
    pub assistant_id: Option<String>,
    pub started_at: Option<Instant>,
}

impl CallState {
    fn idle() -> Self {
        Self {
            status: CallStatus::Idle,
            call_id: None,
            assistant_id: None,
            started_at: None,
        }
    }
}

/// Events observable by the embedding application. Serializable so UI
/// collaborators can forward them as-is.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CallEvent {
    StatusChanged(CallStatus),
    Signaling(SignalingEvent),
    /// Periodic RMS levels for UI meters, roughly every 100 ms.
    AudioActivity { input_level: f32, output_level: f32 },
}

/// Owns one voice call end to end: REST lifecycle, transport, local audio,
/// DSP, jitter buffering, and the pump tasks.
pub struct CallOrchestrator {
    config: SessionConfig,
    rest: RestClient,
    audio: AudioHandle,
    dsp: DspHandle,
    jitter: Arc<JitterBuffer>,
    transport: Mutex<Option<Arc<TransportClient>>>,
    state: Arc<Mutex<CallState>>,
    running: Arc<AtomicBool>,
    muted: Arc<AtomicBool>,
    events: broadcast::Sender<CallEvent>,
}

impl CallOrchestrator {
    /// Orchestrator over real hardware ([`AudioStream`]).
    pub fn new(config: &SessionConfig) -> Self {
        Self::with_audio(config, AudioHandle::new(AudioStream::new(config)))
    }

    /// Orchestrator over a caller-provided audio backend. This is the seam
    /// used for headless and loopback setups.
    pub fn with_audio(config: &SessionConfig, audio: AudioHandle) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        Self {
            rest: RestClient::new(config),
            audio,
            dsp: DspHandle::new(DspProcessor::new(config)),
            jitter: Arc::new(JitterBuffer::new(JitterConfig::from_session(config))),
            transport: Mutex::new(None),
            state: Arc::new(Mutex::new(CallState::idle())),
            running: Arc::new(AtomicBool::new(false)),
            muted: Arc::new(AtomicBool::new(false)),
            events,
            config: config.clone(),
        }
    }

    /// Start a call to the given assistant.
    ///
    /// # Errors
    /// `CallActive` when a call is already in progress; otherwise the first
    /// setup step that failed, with status left at `Failed`.
    pub async fn start_call(&self, assistant_id: &str) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CallError::CallActive);
        }
        if self.transport.lock().is_some() {
            self.running.store(false, Ordering::SeqCst);
            return Err(CallError::CallActive);
        }

        info!(assistant_id, "starting call");
        self.state.lock().assistant_id = Some(assistant_id.to_string());
        self.set_status(CallStatus::Connecting);

        let session = match self.rest.create_web_call(assistant_id).await {
            Ok(session) => session,
            Err(e) => return Err(self.fail_setup(e, None, false).await),
        };

        let transport =
            match TransportClient::connect(&session.transport.websocket_call_url).await {
                Ok(t) => Arc::new(t),
                Err(e) => return Err(self.fail_setup(e, Some(&session.id), false).await),
            };

        if let Err(e) = self.audio.0.lock().start() {
            // No audio means no call, but the transport stays open so
            // diagnostic events keep flowing; end_call finishes the cleanup
            // and terminates the provisioned call server-side.
            warn!("audio start failed: {e}");
            self.running.store(false, Ordering::SeqCst);
            spawn_signaling_forwarder(
                Arc::clone(&transport),
                Arc::clone(&self.running),
                Arc::clone(&self.state),
                self.events.clone(),
            );
            self.state.lock().call_id = Some(session.id.clone());
            *self.transport.lock() = Some(transport);
            self.set_status(CallStatus::Failed);
            return Err(e);
        }

        // Fresh filter and buffer state for every call.
        self.dsp.0.lock().reset();
        self.jitter.stop();
        if let Err(e) = self.jitter.start() {
            transport.close();
            return Err(self.fail_setup(e, Some(&session.id), true).await);
        }

        let audio_rx = match transport.take_audio_receiver() {
            Some(rx) => rx,
            None => {
                transport.close();
                let e = CallError::TransportRuntime("audio receiver already taken".into());
                return Err(self.fail_setup(e, Some(&session.id), true).await);
            }
        };

        let ctx = PumpContext {
            config: self.config.clone(),
            audio: self.audio.clone(),
            dsp: self.dsp.clone(),
            jitter: Arc::clone(&self.jitter),
            transport: Arc::clone(&transport),
            running: Arc::clone(&self.running),
            muted: Arc::clone(&self.muted),
            events: self.events.clone(),
        };
        if let Err(e) = pump::spawn_all(ctx, audio_rx) {
            transport.close();
            return Err(self.fail_setup(e, Some(&session.id), true).await);
        }

        spawn_signaling_forwarder(
            Arc::clone(&transport),
            Arc::clone(&self.running),
            Arc::clone(&self.state),
            self.events.clone(),
        );

        {
            let mut state = self.state.lock();
            state.call_id = Some(session.id.clone());
            state.started_at = Some(Instant::now());
        }
        *self.transport.lock() = Some(transport);
        self.set_status(CallStatus::Connected);
        info!(call_id = %session.id, "call connected");
        Ok(())
    }

    /// End the current call and return to `Idle`. Works from any non-idle
    /// state, including after a remote disconnect or a failed setup.
    ///
    /// # Errors
    /// `NoActiveCall` when there is nothing to tear down.
    pub async fn end_call(&self) -> Result<()> {
        let transport = self.transport.lock().take();
        let active = self.running.swap(false, Ordering::SeqCst);
        if transport.is_none() && !active && self.status() == CallStatus::Idle {
            return Err(CallError::NoActiveCall);
        }

        let call_id = self.state.lock().call_id.clone();
        info!(call_id = call_id.as_deref().unwrap_or("-"), "ending call");

        if let Some(transport) = &transport {
            if transport.is_connected() {
                // Best effort: the server hangs up cleanly on this frame,
                // but the DELETE below covers the case where it is lost.
                let _ = transport.send_text(r#"{"type":"hangup"}"#.into()).await;
            }
        }

        if let Some(id) = &call_id {
            if let Err(e) = self.rest.end_call(id).await {
                warn!(call_id = id.as_str(), "server-side call end failed: {e}");
            }
        }

        // Producer-before-consumer: stop the hardware first, then the
        // buffers it feeds, and close the network last.
        self.audio.0.lock().stop();
        self.jitter.stop();
        if let Some(transport) = &transport {
            transport.close();
        }

        *self.state.lock() = CallState::idle();
        self.set_status(CallStatus::Idle);
        Ok(())
    }

    /// Subscribe to call events. Lossy for slow consumers.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> CallStatus {
        self.state.lock().status
    }

    pub fn state(&self) -> CallState {
        self.state.lock().clone()
    }

    /// Mute replaces outbound audio with silence; capture keeps running so
    /// unmuting is instant.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn jitter_stats(&self) -> JitterStats {
        self.jitter.stats()
    }

    /// Inbound packets dropped on the transport side, if a call is up.
    pub fn dropped_inbound_packets(&self) -> u64 {
        self.transport
            .lock()
            .as_ref()
            .map(|t| t.dropped_audio_packets())
            .unwrap_or(0)
    }

    // Runtime DSP calibration, effective mid-call.

    pub fn set_echo_learning_rate(&self, rate: f32) {
        self.dsp.0.lock().set_learning_rate(rate);
    }

    pub fn set_gate_threshold(&self, threshold: f32) {
        self.dsp.0.lock().set_gate_threshold(threshold);
    }

    pub fn set_gate_ratio(&self, ratio: f32) {
        self.dsp.0.lock().set_gate_ratio(ratio);
    }

    pub fn set_jitter_delay_bounds(&self, min_delay_ms: u64, max_delay_ms: u64) {
        self.jitter.set_delay_bounds(min_delay_ms, max_delay_ms);
    }

    /// Common failure path during setup: roll back, mark `Failed`, hand the
    /// original error back to the caller.
    async fn fail_setup(
        &self,
        error: CallError,
        provisioned_call: Option<&str>,
        audio_started: bool,
    ) -> CallError {
        warn!("call setup failed: {error}");
        if audio_started {
            self.audio.0.lock().stop();
            self.jitter.stop();
        }
        if let Some(id) = provisioned_call {
            if let Err(e) = self.rest.end_call(id).await {
                warn!(call_id = id, "rollback of provisioned call failed: {e}");
            }
        }
        self.running.store(false, Ordering::SeqCst);
        self.set_status(CallStatus::Failed);
        error
    }

    fn set_status(&self, status: CallStatus) {
        set_status(&self.state, &self.events, status);
    }
}

fn set_status(
    state: &Arc<Mutex<CallState>>,
    events: &broadcast::Sender<CallEvent>,
    status: CallStatus,
) {
    state.lock().status = status;
    let _ = events.send(CallEvent::StatusChanged(status));
}

/// Forwards signaling events to subscribers and reacts to socket loss:
/// pumps are stopped and the call goes `Disconnected`, leaving teardown to
/// `end_call`.
fn spawn_signaling_forwarder(
    transport: Arc<TransportClient>,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<CallState>>,
    events: broadcast::Sender<CallEvent>,
) {
    let mut rx = transport.subscribe_events();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    // Normal remote close is Disconnected; a hard socket
                    // failure mid-call is Failed.
                    let terminal_status = match &event {
                        SignalingEvent::SocketClosed => Some(CallStatus::Disconnected),
                        SignalingEvent::SocketError { .. } => Some(CallStatus::Failed),
                        _ => None,
                    };
                    let _ = events.send(CallEvent::Signaling(event));
                    if let Some(status) = terminal_status {
                        if running.swap(false, Ordering::SeqCst) {
                            info!("transport ended the call: {status:?}");
                            set_status(&state, &events, status);
                        }
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "signaling subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
