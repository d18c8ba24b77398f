//! End-to-end call flow against local mock servers: a minimal HTTP endpoint
//! standing in for the call API and a real WebSocket peer. Audio hardware is
//! replaced by a loopback stub so these run headless.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use voxlink_core::{
    transport::encode_pcm16, AudioHandle, AudioIo, CallError, CallEvent, CallOrchestrator,
    CallStatus, Result, SessionConfig, SignalingEvent,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Headless audio backend: capture yields a constant low-level signal,
/// playback records what would have reached the speaker.
struct LoopbackAudio {
    running: bool,
    played_samples: Arc<AtomicUsize>,
    played_peak: Arc<Mutex<f32>>,
}

impl LoopbackAudio {
    fn new() -> (Self, Arc<AtomicUsize>, Arc<Mutex<f32>>) {
        let played_samples = Arc::new(AtomicUsize::new(0));
        let played_peak = Arc::new(Mutex::new(0.0f32));
        (
            Self {
                running: false,
                played_samples: Arc::clone(&played_samples),
                played_peak: Arc::clone(&played_peak),
            },
            played_samples,
            played_peak,
        )
    }
}

impl AudioIo for LoopbackAudio {
    fn start(&mut self) -> Result<()> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn read_capture(&self, n: usize) -> Vec<f32> {
        vec![0.1; n]
    }

    fn write_playback(&self, samples: &[f32]) {
        self.played_samples.fetch_add(samples.len(), Ordering::SeqCst);
        let mut peak = self.played_peak.lock();
        for s in samples {
            if s.abs() > *peak {
                *peak = s.abs();
            }
        }
    }

    fn input_level(&self) -> f32 {
        0.1
    }

    fn output_level(&self) -> f32 {
        0.0
    }
}

/// Audio backend whose startup always fails, as if the device vanished.
struct BrokenAudio;

impl AudioIo for BrokenAudio {
    fn start(&mut self) -> Result<()> {
        Err(CallError::Device("no usable input device".into()))
    }

    fn stop(&mut self) {}

    fn is_running(&self) -> bool {
        false
    }

    fn read_capture(&self, n: usize) -> Vec<f32> {
        vec![0.0; n]
    }

    fn write_playback(&self, _samples: &[f32]) {}

    fn input_level(&self) -> f32 {
        0.0
    }

    fn output_level(&self) -> f32 {
        0.0
    }
}

/// Wire rate and hardware rate are both 16 kHz here so the converters run in
/// passthrough and frames stay at 320 samples end to end.
fn test_config(rest_addr: std::net::SocketAddr) -> SessionConfig {
    SessionConfig {
        api_base_url: format!("http://{rest_addr}"),
        api_key: "test-key".into(),
        hardware_sample_rate: 16_000,
        ..SessionConfig::default()
    }
}

async fn read_http_request(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        let n = stream.read(&mut tmp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let header = String::from_utf8_lossy(&buf[..pos]).into_owned();
            let content_length = header
                .lines()
                .find_map(|line| {
                    let (key, value) = line.split_once(':')?;
                    if key.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            if buf.len() - pos - 4 >= content_length {
                return Some(String::from_utf8_lossy(&buf).into_owned());
            }
        }
    }
}

async fn respond_json(stream: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await.expect("respond");
}

/// Mock call API: `POST /call` provisions (or fails), `DELETE /call/{id}`
/// always succeeds. Counts DELETEs and records when the first one arrived
/// so teardown ordering can be asserted.
async fn spawn_rest_server(
    ws_url: String,
    fail_create: bool,
) -> (
    std::net::SocketAddr,
    Arc<AtomicUsize>,
    Arc<Mutex<Option<std::time::Instant>>>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind rest");
    let addr = listener.local_addr().expect("rest addr");
    let deletes = Arc::new(AtomicUsize::new(0));
    let delete_at = Arc::new(Mutex::new(None));
    let delete_counter = Arc::clone(&deletes);
    let delete_stamp = Arc::clone(&delete_at);

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let ws_url = ws_url.clone();
            let delete_counter = Arc::clone(&delete_counter);
            let delete_stamp = Arc::clone(&delete_stamp);
            tokio::spawn(async move {
                let Some(request) = read_http_request(&mut stream).await else {
                    return;
                };
                if request.starts_with("POST /call") {
                    if fail_create {
                        respond_json(
                            &mut stream,
                            "500 Internal Server Error",
                            r#"{"message":"provisioning failed"}"#,
                        )
                        .await;
                    } else {
                        let body = format!(
                            r#"{{"id":"call_1","status":"queued","transport":{{"websocketCallUrl":"{ws_url}"}}}}"#
                        );
                        respond_json(&mut stream, "200 OK", &body).await;
                    }
                } else if request.starts_with("DELETE /call/") {
                    delete_counter.fetch_add(1, Ordering::SeqCst);
                    delete_stamp.lock().get_or_insert(std::time::Instant::now());
                    respond_json(&mut stream, "200 OK", "{}").await;
                } else {
                    respond_json(&mut stream, "404 Not Found", "{}").await;
                }
            });
        }
    });

    (addr, deletes, delete_at)
}

async fn poll_status(
    orch: &CallOrchestrator,
    wanted: CallStatus,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if orch.status() == wanted {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn failed_provisioning_lands_in_failed_then_resets_to_idle() {
    init_tracing();
    let (rest_addr, _, _) = spawn_rest_server("ws://unused".into(), true).await;
    let (audio, _, _) = LoopbackAudio::new();
    let orch = CallOrchestrator::with_audio(&test_config(rest_addr), AudioHandle::new(audio));

    match orch.start_call("asst_123").await {
        Err(CallError::Rest { status, .. }) => assert_eq!(status, 500),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(orch.status(), CallStatus::Failed);

    // A failed call still tears down cleanly.
    orch.end_call().await.expect("end after failure");
    assert_eq!(orch.status(), CallStatus::Idle);
}

#[tokio::test]
async fn call_streams_audio_both_ways_and_ends_cleanly() {
    init_tracing();
    // WebSocket peer: greets, pushes one loud tone frame, counts what the
    // client sends, and records when the client closes the socket. The peer
    // never closes first — local teardown drives the close.
    let ws_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ws");
    let ws_addr = ws_listener.local_addr().expect("ws addr");
    let frames_from_client = Arc::new(AtomicUsize::new(0));
    let frame_counter = Arc::clone(&frames_from_client);
    let close_at = Arc::new(Mutex::new(None::<std::time::Instant>));
    let close_stamp = Arc::clone(&close_at);

    tokio::spawn(async move {
        let (stream, _) = ws_listener.accept().await.expect("ws accept");
        let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws handshake");
        ws.send(Message::Text(
            r#"{"type":"room-joined","roomId":"r1"}"#.into(),
        ))
        .await
        .expect("greet");

        let tone = encode_pcm16(&vec![0.5f32; 320]);
        ws.send(Message::Binary(tone)).await.expect("tone");

        while let Some(Ok(frame)) = ws.next().await {
            match frame {
                Message::Binary(_) => {
                    frame_counter.fetch_add(1, Ordering::SeqCst);
                }
                Message::Close(_) => {
                    *close_stamp.lock() = Some(std::time::Instant::now());
                    break;
                }
                // Hangup and other text frames: keep reading.
                _ => {}
            }
        }
    });

    let (rest_addr, deletes, delete_at) =
        spawn_rest_server(format!("ws://{ws_addr}"), false).await;
    let (audio, played_samples, played_peak) = LoopbackAudio::new();
    let handle = AudioHandle::new(audio);
    let orch = CallOrchestrator::with_audio(&test_config(rest_addr), handle.clone());

    orch.start_call("asst_123").await.expect("start call");
    assert_eq!(orch.status(), CallStatus::Connected);
    assert!(handle.0.lock().is_running());
    assert_eq!(orch.state().call_id.as_deref(), Some("call_1"));

    // Let the pumps run for a while: mic frames go out every 20 ms, the
    // tone frame travels through jitter buffering to the speaker.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        frames_from_client.load(Ordering::SeqCst) >= 5,
        "expected outbound audio, got {} frames",
        frames_from_client.load(Ordering::SeqCst)
    );
    assert!(played_samples.load(Ordering::SeqCst) > 0);
    assert!(
        *played_peak.lock() > 0.4,
        "tone frame never reached playback, peak={}",
        *played_peak.lock()
    );

    orch.end_call().await.expect("end call");
    assert_eq!(orch.status(), CallStatus::Idle);
    assert!(!handle.0.lock().is_running());
    assert_eq!(deletes.load(Ordering::SeqCst), 1);

    // Teardown order: the server-side call is terminated over REST before
    // the transport socket closes.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while close_at.lock().is_none() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let closed = close_at.lock().expect("peer never saw the close frame");
    let deleted = delete_at.lock().expect("DELETE never arrived");
    assert!(
        deleted <= closed,
        "transport closed {:?} before the REST DELETE",
        closed.duration_since(deleted)
    );

    // Ending twice is an error, not a hang.
    match orch.end_call().await {
        Err(CallError::NoActiveCall) => {}
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn audio_start_failure_keeps_transport_open_for_diagnostics() {
    init_tracing();

    // Peer that emits a diagnostic event well after call setup has failed,
    // and records whether the client ever closed the socket.
    let ws_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ws");
    let ws_addr = ws_listener.local_addr().expect("ws addr");
    let saw_close = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let peer_saw_close = Arc::clone(&saw_close);

    tokio::spawn(async move {
        let (stream, _) = ws_listener.accept().await.expect("ws accept");
        let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws handshake");
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = ws
            .send(Message::Text(
                r#"{"type":"error","message":"input device unavailable"}"#.into(),
            ))
            .await;
        while let Some(Ok(frame)) = ws.next().await {
            if matches!(frame, Message::Close(_)) {
                peer_saw_close.store(true, Ordering::SeqCst);
                break;
            }
        }
    });

    let (rest_addr, deletes, _) = spawn_rest_server(format!("ws://{ws_addr}"), false).await;
    let orch = CallOrchestrator::with_audio(&test_config(rest_addr), AudioHandle::new(BrokenAudio));
    let mut events = orch.subscribe();

    match orch.start_call("asst_123").await {
        Err(CallError::Device(_)) => {}
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(orch.status(), CallStatus::Failed);
    // The provisioned call is not torn down yet; end_call owns the cleanup.
    assert_eq!(deletes.load(Ordering::SeqCst), 0);

    // The still-open transport delivers the server's diagnostic event.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let mut diagnostic_seen = false;
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Ok(CallEvent::Signaling(SignalingEvent::ServerError { message }))) => {
                assert_eq!(message, "input device unavailable");
                diagnostic_seen = true;
                break;
            }
            Ok(Ok(_)) => {}
            Ok(Err(_)) => break,
            Err(_) => {}
        }
    }
    assert!(diagnostic_seen, "diagnostic event never arrived");
    assert!(
        !saw_close.load(Ordering::SeqCst),
        "transport closed before end_call"
    );

    orch.end_call().await.expect("end call");
    assert_eq!(orch.status(), CallStatus::Idle);
    assert_eq!(deletes.load(Ordering::SeqCst), 1);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !saw_close.load(Ordering::SeqCst) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(saw_close.load(Ordering::SeqCst), "end_call never closed the socket");
}

#[tokio::test]
async fn remote_close_transitions_to_disconnected_then_idle() {
    init_tracing();
    let ws_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ws");
    let ws_addr = ws_listener.local_addr().expect("ws addr");

    tokio::spawn(async move {
        let (stream, _) = ws_listener.accept().await.expect("ws accept");
        let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws handshake");
        // Drain a little inbound audio, then hang up from the server side.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = ws.send(Message::Close(None)).await;
        while let Some(Ok(frame)) = ws.next().await {
            if matches!(frame, Message::Close(_)) {
                break;
            }
        }
    });

    let (rest_addr, _, _) = spawn_rest_server(format!("ws://{ws_addr}"), false).await;
    let (audio, _, _) = LoopbackAudio::new();
    let orch = CallOrchestrator::with_audio(&test_config(rest_addr), AudioHandle::new(audio));

    orch.start_call("asst_123").await.expect("start call");
    assert!(
        poll_status(&orch, CallStatus::Disconnected, Duration::from_secs(3)).await,
        "never saw Disconnected, status={:?}",
        orch.status()
    );

    // Starting a new call before cleanup is rejected.
    match orch.start_call("asst_123").await {
        Err(CallError::CallActive) => {}
        other => panic!("unexpected result: {other:?}"),
    }

    orch.end_call().await.expect("end call");
    assert_eq!(orch.status(), CallStatus::Idle);
}
