//! Jitter buffer: absorbs irregular network arrival so playback reads at a
//! steady cadence.
//!
//! ## Mechanics
//!
//! While running, a ticker thread (`crossbeam_channel::tick`, one tick per
//! packet interval) pops the oldest queued frame and forwards it into a
//! bounded output channel; an empty queue forwards silence and counts an
//! underrun. `write_audio` appends at the tail, dropping the oldest frame
//! (and counting an overrun) past the max-delay-derived capacity.
//!
//! The target delay adapts on every write with hysteresis: depth below half
//! the target nudges the target up one step, depth above double the target
//! nudges it down, both clamped to the configured [min, max]. The dead zone
//! between the two thresholds keeps the target from oscillating while still
//! tracking slowly varying network jitter.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::error::{CallError, Result};

/// Target delay adjustment per adaptation step (ms).
const ADAPT_STEP_MS: u64 = 10;

/// Output channel depth in packets. Keeps the playback pump at most a few
/// packets behind the ticker without unbounded queueing.
const OUTPUT_CHANNEL_PACKETS: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct JitterConfig {
    pub min_delay_ms: u64,
    pub start_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Expected inbound packet interval (ms).
    pub packet_ms: u64,
    /// Samples per packet at the wire rate.
    pub frame_len: usize,
}

impl JitterConfig {
    pub fn from_session(config: &SessionConfig) -> Self {
        Self {
            min_delay_ms: config.jitter_min_delay_ms,
            start_delay_ms: config.jitter_start_delay_ms,
            max_delay_ms: config.jitter_max_delay_ms,
            packet_ms: config.packet_ms,
            frame_len: config.wire_frame_len(),
        }
    }

    fn max_queue_packets(&self) -> usize {
        (self.max_delay_ms / self.packet_ms).max(1) as usize
    }
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self::from_session(&SessionConfig::default())
    }
}

/// Diagnostic snapshot.
#[derive(Debug, Clone, Copy)]
pub struct JitterStats {
    pub underruns: u64,
    pub overruns: u64,
    pub target_delay_ms: u64,
    pub queued_packets: usize,
}

struct Queue {
    frames: VecDeque<Vec<f32>>,
    target_delay_ms: u64,
}

/// Adaptive jitter buffer for inbound 16 kHz audio frames.
pub struct JitterBuffer {
    /// Behind a mutex so the delay bounds can be recalibrated mid-call.
    config: Mutex<JitterConfig>,
    queue: Arc<Mutex<Queue>>,
    running: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
    overruns: Arc<AtomicU64>,
    out_tx: Sender<Vec<f32>>,
    out_rx: Receiver<Vec<f32>>,
    /// Partial frame kept between `read_audio` calls.
    leftover: Mutex<Vec<f32>>,
    ticker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl JitterBuffer {
    pub fn new(config: JitterConfig) -> Self {
        let (out_tx, out_rx) = bounded(OUTPUT_CHANNEL_PACKETS);
        Self {
            queue: Arc::new(Mutex::new(Queue {
                frames: VecDeque::new(),
                target_delay_ms: config.start_delay_ms,
            })),
            config: Mutex::new(config),
            running: Arc::new(AtomicBool::new(false)),
            underruns: Arc::new(AtomicU64::new(0)),
            overruns: Arc::new(AtomicU64::new(0)),
            out_tx,
            out_rx,
            leftover: Mutex::new(Vec::new()),
            ticker: Mutex::new(None),
        }
    }

    /// Spawn the ticker thread. Fails if already running.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CallError::AlreadyRunning);
        }
        let config = *self.config.lock();

        {
            let mut queue = self.queue.lock();
            queue.frames.clear();
            queue.target_delay_ms = config.start_delay_ms;
        }
        self.leftover.lock().clear();
        self.underruns.store(0, Ordering::Relaxed);
        self.overruns.store(0, Ordering::Relaxed);

        let queue = Arc::clone(&self.queue);
        let running = Arc::clone(&self.running);
        let underruns = Arc::clone(&self.underruns);
        let out_tx = self.out_tx.clone();
        let frame_len = config.frame_len;
        let tick = crossbeam_channel::tick(Duration::from_millis(config.packet_ms));

        let ticker = std::thread::Builder::new()
            .name("voxlink-jitter".into())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    if tick.recv().is_err() {
                        break;
                    }
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }

                    let frame = queue.lock().frames.pop_front();
                    let frame = match frame {
                        Some(f) => f,
                        None => {
                            underruns.fetch_add(1, Ordering::Relaxed);
                            vec![0.0; frame_len]
                        }
                    };
                    // A stalled consumer loses this packet; the playback path
                    // zero-fills on its side, so dropping beats blocking the tick.
                    if out_tx.try_send(frame).is_err() {
                        debug!("jitter output channel full — packet dropped");
                    }
                }
                info!("jitter ticker stopped");
            })
            .map_err(|e| CallError::Other(anyhow::anyhow!("jitter ticker spawn: {e}")))?;

        *self.ticker.lock() = Some(ticker);
        Ok(())
    }

    /// Stop the ticker. Safe to call repeatedly or before `start`.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(ticker) = self.ticker.lock().take() {
            let _ = ticker.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Queue a network-delivered frame and adapt the target delay.
    pub fn write_audio(&self, frame: Vec<f32>) {
        let config = *self.config.lock();
        let mut queue = self.queue.lock();
        queue.frames.push_back(frame);

        if queue.frames.len() > config.max_queue_packets() {
            queue.frames.pop_front();
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }

        queue.target_delay_ms =
            adapt_target_delay(queue.target_delay_ms, queue.frames.len(), &config);
    }

    /// Recalibrate the delay bounds mid-call. The current target is clamped
    /// into the new range immediately.
    pub fn set_delay_bounds(&self, min_delay_ms: u64, max_delay_ms: u64) {
        let max_delay_ms = max_delay_ms.max(min_delay_ms);
        {
            let mut config = self.config.lock();
            config.min_delay_ms = min_delay_ms;
            config.max_delay_ms = max_delay_ms;
        }
        let mut queue = self.queue.lock();
        queue.target_delay_ms = queue.target_delay_ms.clamp(min_delay_ms, max_delay_ms);
    }

    /// Read `n` samples at a steady pace; silence on timeout, never blocking
    /// longer than a couple of packet intervals.
    pub fn read_audio(&self, n: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(n);
        let mut leftover = self.leftover.lock();
        let timeout = Duration::from_millis(self.config.lock().packet_ms * 2);

        while out.len() < n {
            if !leftover.is_empty() {
                let take = (n - out.len()).min(leftover.len());
                out.extend(leftover.drain(..take));
                continue;
            }
            match self.out_rx.recv_timeout(timeout) {
                Ok(frame) => *leftover = frame,
                Err(_) => {
                    out.resize(n, 0.0);
                    break;
                }
            }
        }
        out
    }

    pub fn stats(&self) -> JitterStats {
        let queue = self.queue.lock();
        JitterStats {
            underruns: self.underruns.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            target_delay_ms: queue.target_delay_ms,
            queued_packets: queue.frames.len(),
        }
    }
}

impl Drop for JitterBuffer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One adaptation step: hysteresis between half and double the target depth.
fn adapt_target_delay(target_ms: u64, depth_packets: usize, config: &JitterConfig) -> u64 {
    let target_packets = (target_ms / config.packet_ms).max(1) as usize;
    if depth_packets < target_packets / 2 {
        (target_ms + ADAPT_STEP_MS).min(config.max_delay_ms)
    } else if depth_packets > target_packets * 2 {
        target_ms.saturating_sub(ADAPT_STEP_MS).max(config.min_delay_ms)
    } else {
        target_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> JitterConfig {
        JitterConfig {
            min_delay_ms: 40,
            start_delay_ms: 60,
            max_delay_ms: 200,
            packet_ms: 20,
            frame_len: 320,
        }
    }

    fn frame(value: f32) -> Vec<f32> {
        vec![value; 320]
    }

    #[test]
    fn target_delay_rises_when_starved_and_stays_in_bounds() {
        let config = test_config();
        let mut target = config.start_delay_ms;
        // Depth 0 for many packets: target climbs to max and stops there.
        for _ in 0..100 {
            target = adapt_target_delay(target, 0, &config);
            assert!(target <= config.max_delay_ms);
            assert!(target >= config.min_delay_ms);
        }
        assert_eq!(target, config.max_delay_ms);
    }

    #[test]
    fn target_delay_falls_when_flooded_and_stays_in_bounds() {
        let config = test_config();
        let mut target = config.max_delay_ms;
        for _ in 0..100 {
            target = adapt_target_delay(target, 50, &config);
            assert!(target >= config.min_delay_ms);
        }
        assert_eq!(target, config.min_delay_ms);
    }

    #[test]
    fn target_delay_holds_inside_the_hysteresis_band() {
        let config = test_config();
        // Target 60 ms = 3 packets; depth 2 is within [1, 6] → unchanged.
        assert_eq!(adapt_target_delay(60, 2, &config), 60);
        assert_eq!(adapt_target_delay(60, 6, &config), 60);
    }

    #[test]
    fn overrun_drops_the_oldest_frame() {
        let config = test_config();
        let max = config.max_queue_packets();
        let jb = JitterBuffer::new(config);
        for i in 0..=max {
            jb.write_audio(frame(i as f32));
        }
        let stats = jb.stats();
        assert_eq!(stats.overruns, 1);
        assert_eq!(stats.queued_packets, max);
        // Oldest (0.0) was evicted.
        assert_eq!(jb.queue.lock().frames.front().map(|f| f[0]), Some(1.0));
    }

    #[test]
    fn running_buffer_delivers_frames_in_order() {
        let jb = JitterBuffer::new(test_config());
        jb.start().expect("start");
        jb.write_audio(frame(0.25));
        jb.write_audio(frame(0.5));

        // Early ticks may deliver underrun silence; the two real frames must
        // still come out in write order.
        let mut seen = Vec::new();
        for _ in 0..50 {
            let out = jb.read_audio(320);
            if out[0] != 0.0 {
                seen.push(out[0]);
            }
            if seen.len() == 2 {
                break;
            }
        }
        jb.stop();

        assert_eq!(seen, vec![0.25, 0.5]);
    }

    #[test]
    fn empty_queue_yields_silence_and_counts_underruns() {
        let jb = JitterBuffer::new(test_config());
        jb.start().expect("start");
        let out = jb.read_audio(320);
        jb.stop();

        assert_eq!(out, vec![0.0; 320]);
        assert!(jb.stats().underruns >= 1);
    }

    #[test]
    fn steady_cadence_keeps_depth_within_one_packet_of_target() {
        let config = test_config();
        let target_packets = (config.start_delay_ms / config.packet_ms) as i64;
        let jb = JitterBuffer::new(config);
        jb.start().expect("start");

        // Prefill to the target depth, then hold a one-in-one-out cadence:
        // each read blocks on the ticker, pacing the loop at the packet
        // interval while the writes keep up.
        for _ in 0..target_packets {
            jb.write_audio(frame(0.1));
        }
        for _ in 0..30 {
            jb.write_audio(frame(0.1));
            let _ = jb.read_audio(320);
        }

        let stats = jb.stats();
        jb.stop();

        // Depth in the hysteresis band leaves the target untouched, and the
        // queue settles within one packet of it.
        assert_eq!(stats.target_delay_ms, 60);
        assert!(
            (stats.queued_packets as i64 - target_packets).abs() <= 1,
            "depth {} drifted from target {target_packets} packets",
            stats.queued_packets
        );
    }

    #[test]
    fn delay_bounds_can_be_recalibrated_and_clamp_the_target() {
        let jb = JitterBuffer::new(test_config());
        assert_eq!(jb.stats().target_delay_ms, 60);
        jb.set_delay_bounds(100, 300);
        assert_eq!(jb.stats().target_delay_ms, 100);
        jb.set_delay_bounds(20, 40);
        assert_eq!(jb.stats().target_delay_ms, 40);
    }

    #[test]
    fn stop_is_idempotent_and_start_twice_fails() {
        let jb = JitterBuffer::new(test_config());
        jb.stop();
        jb.start().expect("start");
        assert!(jb.start().is_err());
        jb.stop();
        jb.stop();
        assert!(!jb.is_running());
    }
}
