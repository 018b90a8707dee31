//! Bounded hand-off queue between the capture driver thread and the consumer
//!
//! Single point of contact between the two execution contexts: the completion
//! sink pushes, `Streamer::frame` pops. Real-time capture must never stall
//! the driver thread, so a full queue evicts its oldest entry instead of
//! blocking the producer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use tracing::trace;

use super::buffer::FrameBuffer;

/// Outcome of a [`FrameQueue::pop`]
#[derive(Debug)]
pub enum PopOutcome {
    Frame(FrameBuffer),
    /// Nothing arrived within the timeout; recoverable, retry
    Empty,
    /// Terminal; every subsequent pop repeats it
    EndOfStream,
}

/// Queue counters, snapshot via [`FrameQueue::stats`]
#[derive(Debug, Default, Clone, Copy)]
pub struct QueueStats {
    pub pushed: usize,
    pub popped: usize,
    pub dropped: usize,
}

#[derive(Default)]
struct Counters {
    pushed: AtomicUsize,
    popped: AtomicUsize,
    dropped: AtomicUsize,
}

struct Inner {
    frames: VecDeque<FrameBuffer>,
    eos: bool,
}

/// Bounded FIFO of completed frames, drop-oldest on overflow, sticky
/// end-of-stream marker.
pub struct FrameQueue {
    inner: Mutex<Inner>,
    available: Condvar,
    capacity: usize,
    stats: CachePadded<Counters>,
}

impl FrameQueue {
    /// Capacity matches the number of in-flight capture buffers.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                eos: false,
            }),
            available: Condvar::new(),
            capacity,
            stats: CachePadded::new(Counters::default()),
        }
    }

    /// Append a completed frame; evicts and releases the oldest entry when
    /// the queue is full. Frames pushed after end-of-stream are released and
    /// discarded.
    pub fn push(&self, frame: FrameBuffer) {
        let evicted = {
            let mut inner = self.inner.lock().unwrap();
            if inner.eos {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                drop(inner);
                let _ = frame.release();
                return;
            }
            let evicted = if inner.frames.len() == self.capacity {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                inner.frames.pop_front()
            } else {
                None
            };
            inner.frames.push_back(frame);
            self.stats.pushed.fetch_add(1, Ordering::Relaxed);
            evicted
        };
        // release outside the lock; recycling takes the pool mutex
        if let Some(old) = evicted {
            trace!(pts_us = old.pts_us(), "dropping oldest queued frame");
            let _ = old.release();
        }
        self.available.notify_one();
    }

    /// Mark end-of-stream. Anything still queued is released; the marker is
    /// sticky and all waiters are woken. Idempotent.
    pub fn push_eos(&self) {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            inner.eos = true;
            std::mem::take(&mut inner.frames)
        };
        for frame in pending {
            let _ = frame.release();
        }
        self.available.notify_all();
    }

    /// Block until a frame is available, the timeout elapses, or the stream
    /// has ended. Holds no lock beyond the internal wait.
    pub fn pop(&self, timeout: Duration) -> PopOutcome {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.eos {
                return PopOutcome::EndOfStream;
            }
            if let Some(frame) = inner.frames.pop_front() {
                self.stats.popped.fetch_add(1, Ordering::Relaxed);
                return PopOutcome::Frame(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return PopOutcome::Empty;
            }
            let (guard, _) = self
                .available
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            popped: self.stats.popped.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}
