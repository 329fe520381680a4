//! Bounded lock-free jitter queue
//!
//! One queue per channel smooths packet arrival timing between the receiver
//! thread (producer) and the mixer thread (consumer). The queue is strict
//! FIFO: this wire carries no sequence numbers, so frames are played in the
//! order they were decoded. On overflow the oldest frame is discarded and
//! the new one accepted — there is deliberately no back-pressure toward the
//! socket, which would drop datagrams at the kernel layer instead, where it
//! is unobservable.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;

use chorus_common::voice::MAX_QUEUE_FRAMES;

// =============================================================================
// PCM Frame
// =============================================================================

/// One decoded frame of mono PCM at 48 kHz
///
/// Ownership moves from the ingress pipeline into the jitter queue and from
/// there into the mixer's accumulation buffer.
#[derive(Debug, Clone)]
pub struct PcmFrame {
    /// Signed 16-bit samples; every element is valid
    pub samples: Vec<i16>,
}

impl PcmFrame {
    /// Wrap decoded samples
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// Number of valid samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True if the frame holds no samples
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

// =============================================================================
// Jitter Queue
// =============================================================================

/// Bounded lock-free FIFO of decoded frames for a single channel
///
/// Capacity is fixed at [`MAX_QUEUE_FRAMES`]. Producers never block; a push
/// against a full queue displaces the head (oldest) frame and counts an
/// overflow.
pub struct JitterQueue {
    queue: ArrayQueue<PcmFrame>,
    overflows: AtomicU64,
}

impl JitterQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            queue: ArrayQueue::new(MAX_QUEUE_FRAMES),
            overflows: AtomicU64::new(0),
        }
    }

    /// Push a frame, discarding the oldest frame if the queue is full
    ///
    /// Returns `true` if a frame was discarded.
    pub fn push(&self, frame: PcmFrame) -> bool {
        if self.queue.force_push(frame).is_some() {
            self.overflows.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Pop the oldest frame
    pub fn pop(&self) -> Option<PcmFrame> {
        self.queue.pop()
    }

    /// Number of queued frames
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if no frames are queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total frames discarded to overflow since creation
    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }
}

impl Default for JitterQueue {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
