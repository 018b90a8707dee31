//! Pool-backed frame buffers
//!
//! The capture subsystem owns a fixed set of physical buffers. A completed
//! frame is copied into a pool slot and handed out as a reference-counted
//! [`FrameBuffer`]; when the last handle is released the slot returns to the
//! pool. Retaining handles without releasing them exhausts the pool and new
//! captures are skipped until a release recycles a slot.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use arc_swap::ArcSwapOption;
use thiserror::Error;

use crate::capture::frame::PixelFormat;

/// Buffer lifecycle errors. Both indicate a consumer-side programming error.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer handle released twice")]
    DoubleRelease,

    #[error("buffer accessed after release")]
    UseAfterRelease,
}

/// Metadata carried with every captured frame
#[derive(Debug, Clone)]
pub struct FrameMeta {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    /// Presentation timestamp in microseconds, zero at the first frame of the
    /// stream instance
    pub pts_us: i64,
    /// Frame index within the stream instance
    pub sequence: u64,
}

/// Fixed pool of reusable frame memory.
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    slot_size: usize,
    capacity: usize,
}

impl BufferPool {
    /// Pre-allocate `capacity` slots of `slot_size` bytes each.
    pub fn new(capacity: usize, slot_size: usize) -> Self {
        let free = (0..capacity)
            .map(|_| Vec::with_capacity(slot_size))
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                slot_size,
                capacity,
            }),
        }
    }

    /// Copy a completed frame into a free slot.
    ///
    /// Returns `None` when the pool is exhausted; the caller skips the frame
    /// rather than blocking the driver thread.
    pub fn wrap(&self, data: &[u8], meta: FrameMeta) -> Option<FrameBuffer> {
        let mut slot = self.inner.free.lock().unwrap().pop()?;
        slot.clear();
        slot.extend_from_slice(data);
        Some(FrameBuffer {
            slot: Arc::new(Slot {
                mem: ArcSwapOption::from_pointee(slot),
                refs: AtomicUsize::new(1),
                pool: Arc::downgrade(&self.inner),
            }),
            meta,
            released: AtomicBool::new(false),
        })
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

struct Slot {
    /// Swapped out exactly once, when the refcount reaches zero
    mem: ArcSwapOption<Vec<u8>>,
    refs: AtomicUsize,
    pool: Weak<PoolInner>,
}

impl Slot {
    fn drop_ref(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let Some(mem) = self.mem.swap(None) else {
            return;
        };
        if let Some(pool) = self.pool.upgrade() {
            // An outstanding data() guard keeps the Arc alive; hand the pool
            // a replacement slot so capacity stays constant.
            let slot = Arc::try_unwrap(mem)
                .unwrap_or_else(|_| Vec::with_capacity(pool.slot_size));
            let mut free = pool.free.lock().unwrap();
            if free.len() < pool.capacity {
                free.push(slot);
            }
        }
    }
}

/// A reference-counted handle to one captured frame.
///
/// `acquire` adds a handle; `release` drops one and, at zero, returns the
/// memory to the pool. Each handle may be released at most once and its data
/// is inaccessible afterwards.
pub struct FrameBuffer {
    slot: Arc<Slot>,
    meta: FrameMeta,
    released: AtomicBool,
}

impl FrameBuffer {
    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    pub fn pts_us(&self) -> i64 {
        self.meta.pts_us
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    /// Read-only access to the pixel data for the handle's lifetime.
    pub fn data(&self) -> Result<Arc<Vec<u8>>, BufferError> {
        if self.released.load(Ordering::Acquire) {
            return Err(BufferError::UseAfterRelease);
        }
        self.slot.mem.load_full().ok_or(BufferError::UseAfterRelease)
    }

    /// Take an additional handle on the same frame.
    pub fn acquire(&self) -> Result<FrameBuffer, BufferError> {
        if self.released.load(Ordering::Acquire) {
            return Err(BufferError::UseAfterRelease);
        }
        self.slot.refs.fetch_add(1, Ordering::Relaxed);
        Ok(FrameBuffer {
            slot: Arc::clone(&self.slot),
            meta: self.meta.clone(),
            released: AtomicBool::new(false),
        })
    }

    /// Relinquish this handle. The last release of a frame returns its slot
    /// to the pool, which may let a stalled capture pipeline resume.
    pub fn release(&self) -> Result<(), BufferError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(BufferError::DoubleRelease);
        }
        self.slot.drop_ref();
        Ok(())
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        // Safety net for handles dropped without an explicit release
        if !self.released.swap(true, Ordering::AcqRel) {
            self.slot.drop_ref();
        }
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("meta", &self.meta)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pts_us: i64) -> FrameMeta {
        FrameMeta {
            width: 4,
            height: 2,
            stride: 12,
            format: PixelFormat::Bgr24,
            pts_us,
            sequence: 0,
        }
    }

    #[test]
    fn release_returns_slot_to_pool_once() {
        let pool = BufferPool::new(2, 24);
        let buf = pool.wrap(&[1u8; 24], meta(0)).unwrap();
        assert_eq!(pool.available(), 1);

        buf.release().unwrap();
        assert_eq!(pool.available(), 2);

        assert_eq!(buf.release(), Err(BufferError::DoubleRelease));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn data_after_release_is_rejected() {
        let pool = BufferPool::new(1, 8);
        let buf = pool.wrap(&[7u8; 8], meta(0)).unwrap();
        assert_eq!(buf.data().unwrap().as_slice(), &[7u8; 8]);
        buf.release().unwrap();
        assert_eq!(buf.data(), Err(BufferError::UseAfterRelease));
        assert!(buf.acquire().is_err());
    }

    #[test]
    fn acquire_keeps_frame_alive_past_first_release() {
        let pool = BufferPool::new(1, 8);
        let a = pool.wrap(&[3u8; 8], meta(0)).unwrap();
        let b = a.acquire().unwrap();

        a.release().unwrap();
        // second handle still reads, slot not yet recycled
        assert_eq!(b.data().unwrap().as_slice(), &[3u8; 8]);
        assert_eq!(pool.available(), 0);

        b.release().unwrap();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn exhausted_pool_refuses_wrap() {
        let pool = BufferPool::new(1, 8);
        let held = pool.wrap(&[0u8; 8], meta(0)).unwrap();
        assert!(pool.wrap(&[0u8; 8], meta(1)).is_none());
        held.release().unwrap();
        assert!(pool.wrap(&[0u8; 8], meta(2)).is_some());
    }

    #[test]
    fn implicit_drop_recycles() {
        let pool = BufferPool::new(1, 8);
        {
            let _buf = pool.wrap(&[0u8; 8], meta(0)).unwrap();
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 1);
    }
}
