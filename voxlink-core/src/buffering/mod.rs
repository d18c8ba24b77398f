//! Sample ring buffers shared between hardware callbacks and pump loops.
//!
//! Storage is `ringbuf::HeapRb<f32>` behind a `parking_lot::Mutex`. One
//! writer and one reader share each ring, and both sides are strictly
//! non-blocking: a full ring evicts its oldest samples on write, an empty
//! ring zero-fills on read. The playback path must never stall waiting for
//! samples, so neither operation can block.
//!
//! The mutex is held only around index/count mutation — never across device
//! or network I/O — which keeps the hardware callback within its frame
//! period.

use std::sync::Arc;

use parking_lot::Mutex;
use ringbuf::{
    traits::{Consumer, Observer, RingBuffer},
    HeapRb,
};

/// Fixed-capacity circular buffer of mono f32 samples.
///
/// Cloning yields another handle to the same ring.
#[derive(Clone)]
pub struct SampleRing {
    inner: Arc<Mutex<HeapRb<f32>>>,
    capacity: usize,
}

impl SampleRing {
    /// Create a ring holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HeapRb::new(capacity))),
            capacity,
        }
    }

    /// Append `samples`, evicting the oldest samples if the ring is full.
    ///
    /// Always accepts the entire slice; returns the number written (which is
    /// `samples.len()`, kept as a return value for symmetry with `read`).
    pub fn write(&self, samples: &[f32]) -> usize {
        let mut rb = self.inner.lock();
        // Slices longer than the ring keep only the newest `capacity` samples.
        let tail = if samples.len() > self.capacity {
            &samples[samples.len() - self.capacity..]
        } else {
            samples
        };
        rb.push_slice_overwrite(tail);
        samples.len()
    }

    /// Read up to `n` samples; the missing tail is zero-filled.
    pub fn read(&self, n: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; n];
        self.read_into(&mut out);
        out
    }

    /// Allocation-free variant of [`read`](Self::read) for hardware callbacks.
    ///
    /// Fills `out` from the ring, zeroing whatever the ring could not supply.
    /// Returns the number of real (non-padded) samples.
    pub fn read_into(&self, out: &mut [f32]) -> usize {
        let popped = {
            let mut rb = self.inner.lock();
            rb.pop_slice(out)
        };
        for sample in &mut out[popped..] {
            *sample = 0.0;
        }
        popped
    }

    /// Number of samples currently buffered. Always `<= capacity()`.
    pub fn available(&self) -> usize {
        self.inner.lock().occupied_len()
    }

    /// Maximum number of samples the ring can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop all buffered samples.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl std::fmt::Debug for SampleRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleRing")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}
