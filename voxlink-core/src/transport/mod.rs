//! WebSocket transport to the remote voice service.
//!
//! One persistent connection multiplexes two payload kinds:
//!
//! - **Text frames**: JSON control messages (`type`-discriminated), decoded
//!   by [`events::SignalingEvent`] and fanned out on a lossy broadcast
//!   channel — a slow UI consumer may miss control events, never audio.
//! - **Binary frames**: raw little-endian i16 PCM mono at the wire rate,
//!   decoded to normalized f32 and pushed into a bounded audio channel that
//!   the orchestrator drains into the jitter buffer. A full audio channel
//!   drops the packet (counted) rather than blocking the socket reader.
//!
//! The writer task owns the sink half; `send_audio`/`send_text` queue frames
//! through a bounded mpsc, so no lock is ever held across socket I/O.
//! `close()` is idempotent and unblocks both tasks through a watch channel
//! within one read cycle.

pub mod events;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{CallError, Result};

pub use events::SignalingEvent;

/// Control event fan-out capacity. Control traffic is allowed to be lossy.
const EVENT_CHANNEL_CAP: usize = 100;

/// Inbound audio channel capacity in packets (~640 ms at 20 ms/packet).
const AUDIO_CHANNEL_CAP: usize = 32;

/// Outbound frame queue capacity.
const OUTBOUND_CHANNEL_CAP: usize = 32;

/// Decode a binary frame of little-endian i16 PCM into normalized f32.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32767.0)
        .collect()
}

/// Encode normalized f32 samples as little-endian i16 PCM.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        let q = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
        out.extend_from_slice(&q.to_le_bytes());
    }
    out
}

/// Live WebSocket connection to the remote service.
pub struct TransportClient {
    event_tx: broadcast::Sender<SignalingEvent>,
    /// Taken exactly once by the inbound pump.
    audio_rx: Mutex<Option<mpsc::Receiver<Vec<f32>>>>,
    outbound_tx: mpsc::Sender<Message>,
    shutdown_tx: watch::Sender<bool>,
    connected: Arc<AtomicBool>,
    dropped_audio: Arc<AtomicU64>,
}

impl TransportClient {
    /// Connect and spawn the read loop + writer task.
    ///
    /// # Errors
    /// Fails fast on a rejected handshake, carrying the HTTP status and body
    /// when the server provided them.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _response) = connect_async(url).await.map_err(handshake_error)?;
        info!(url, "transport connected");

        let (mut sink, mut stream) = ws.split();
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        let (audio_tx, audio_rx) = mpsc::channel::<Vec<f32>>(AUDIO_CHANNEL_CAP);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_CHANNEL_CAP);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(true));
        let dropped_audio = Arc::new(AtomicU64::new(0));

        // Writer task: sole owner of the sink half.
        let mut writer_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.changed() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    frame = outbound_rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = sink.send(frame).await {
                                warn!("transport send failed: {e}");
                                break;
                            }
                        }
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            }
            debug!("transport writer stopped");
        });

        // Read loop: decodes frames until close, error, or shutdown.
        let read_event_tx = event_tx.clone();
        let read_connected = Arc::clone(&connected);
        let read_dropped = Arc::clone(&dropped_audio);
        let mut read_shutdown = shutdown_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = read_shutdown.changed() => break,
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Binary(data))) => {
                            if audio_tx.try_send(decode_pcm16(&data)).is_err() {
                                read_dropped.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            let _ = read_event_tx.send(SignalingEvent::from_json(&text));
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("transport closed by peer");
                            let _ = read_event_tx.send(SignalingEvent::SocketClosed);
                            break;
                        }
                        Some(Ok(_)) => {} // ping/pong — handled by tungstenite
                        Some(Err(e)) => {
                            warn!("transport read failed: {e}");
                            let _ = read_event_tx.send(SignalingEvent::SocketError {
                                message: e.to_string(),
                            });
                            break;
                        }
                    }
                }
            }
            read_connected.store(false, Ordering::SeqCst);
            debug!("transport read loop stopped");
        });

        Ok(Self {
            event_tx,
            audio_rx: Mutex::new(Some(audio_rx)),
            outbound_tx,
            shutdown_tx,
            connected,
            dropped_audio,
        })
    }

    /// Subscribe to decoded control events. Lossy for slow consumers.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Take the inbound audio receiver. Yields `None` after the first call.
    pub fn take_audio_receiver(&self) -> Option<mpsc::Receiver<Vec<f32>>> {
        self.audio_rx.lock().take()
    }

    /// Quantize and send one audio frame as a binary message.
    pub async fn send_audio(&self, samples: &[f32]) -> Result<()> {
        if !self.is_connected() {
            return Err(CallError::NotConnected);
        }
        self.outbound_tx
            .send(Message::Binary(encode_pcm16(samples)))
            .await
            .map_err(|_| CallError::NotConnected)
    }

    /// Send a raw JSON control frame.
    pub async fn send_text(&self, json: String) -> Result<()> {
        if !self.is_connected() {
            return Err(CallError::NotConnected);
        }
        self.outbound_tx
            .send(Message::Text(json))
            .await
            .map_err(|_| CallError::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Inbound packets dropped because the audio channel was full.
    pub fn dropped_audio_packets(&self) -> u64 {
        self.dropped_audio.load(Ordering::Relaxed)
    }

    /// Request shutdown: the writer sends a close frame and the read loop
    /// unblocks within one cycle. Safe to call repeatedly, from any thread.
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
    }
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn handshake_error(err: tungstenite::Error) -> CallError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            CallError::TransportConnect(format!("HTTP {status}: {body}"))
        }
        other => CallError::TransportConnect(other.to_string()),
    }
}
