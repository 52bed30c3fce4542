//! Frame pool: a typed free list of reusable frame wrappers.
//!
//! The pool hands out boxed wrappers so a recycled object keeps its heap
//! identity; the caller reassigns every field before reuse (for
//! [`RawFrame`](crate::RawFrame) via `refill`).
//!
//! # Thread safety
//!
//! The pool is the one resource shared across threads without a
//! serializing owner, so the free list sits behind its own
//! `parking_lot::Mutex`. Share it as `Arc<FramePool<T>>`.

use parking_lot::Mutex;
use tracing::debug;

use crate::error::PoolError;

/// Statistics about pool usage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Wrappers currently sitting in the free list.
    pub available: usize,
    /// Wrappers allocated because the free list was empty.
    pub allocated: u64,
    /// Wrappers served from the free list.
    pub reused: u64,
}

struct PoolInner<T> {
    free: Vec<Box<T>>,
    closed: bool,
    allocated: u64,
    reused: u64,
}

/// A thread-safe free list keyed by wrapper type.
pub struct FramePool<T> {
    inner: Mutex<PoolInner<T>>,
    /// Maximum number of idle wrappers kept; extra returns are dropped.
    max_idle: Option<usize>,
}

impl<T: Default + Send> FramePool<T> {
    /// Create an unbounded pool.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                closed: false,
                allocated: 0,
                reused: 0,
            }),
            max_idle: None,
        }
    }

    /// Create a pool retaining at most `max_idle` idle wrappers.
    pub fn with_max_idle(max_idle: usize) -> Self {
        Self {
            max_idle: Some(max_idle),
            ..Self::new()
        }
    }

    /// Return a recycled wrapper, or allocate a new one.
    pub fn get(&self) -> Box<T> {
        let mut inner = self.inner.lock();
        match inner.free.pop() {
            Some(item) => {
                inner.reused += 1;
                item
            }
            None => {
                inner.allocated += 1;
                Box::default()
            }
        }
    }

    /// Give a wrapper back to the pool.
    ///
    /// # Errors
    /// Returns `PoolError::Closed` once [`close`](Self::close) has been called;
    /// the wrapper is dropped in that case.
    pub fn put(&self, item: Box<T>) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(PoolError::Closed);
        }
        if self.max_idle.is_some_and(|max| inner.free.len() >= max) {
            return Ok(());
        }
        inner.free.push(item);
        Ok(())
    }

    /// Close the pool and drop every idle wrapper. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        let dropped = inner.free.len();
        inner.free.clear();
        debug!(dropped, "Frame pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of idle wrappers.
    pub fn len(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            available: inner.free.len(),
            allocated: inner.allocated,
            reused: inner.reused,
        }
    }
}

impl<T: Default + Send> Default for FramePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for FramePool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("FramePool")
            .field("available", &inner.free.len())
            .field("closed", &inner.closed)
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RawFrame;
    use crate::types::Timestamp;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn get_allocates_when_empty() {
        let pool: FramePool<RawFrame> = FramePool::new();
        let frame = pool.get();
        assert!(frame.is_empty());
        assert_eq!(pool.stats().allocated, 1);
        assert_eq!(pool.stats().reused, 0);
    }

    #[test]
    fn get_after_put_returns_same_instance_fully_overwritten() {
        let pool: FramePool<RawFrame> = FramePool::new();

        let mut frame = pool.get();
        frame.refill(Bytes::from_static(b"first frame"), Timestamp::from_micros(1_000), None);
        let first_addr = &*frame as *const RawFrame;
        frame.release();
        pool.put(frame).unwrap();

        let mut reused = pool.get();
        assert_eq!(&*reused as *const RawFrame, first_addr);
        // Released wrappers carry nothing from their previous life.
        assert!(reused.is_empty());
        assert_eq!(reused.pts(), Timestamp::ZERO);

        reused.refill(Bytes::from_static(b"second"), Timestamp::from_micros(2_000), None);
        assert_eq!(reused.data(), b"second");
        assert_eq!(reused.pts().as_micros(), 2_000);
        assert!(!reused.has_pending_release());
        assert_eq!(pool.stats().reused, 1);
    }

    #[test]
    fn refill_without_release_still_clears_stale_callback() {
        let pool: FramePool<RawFrame> = FramePool::new();
        let released = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = released.clone();

        let mut frame = pool.get();
        frame.refill(
            Bytes::from_static(b"stale"),
            Timestamp::from_micros(7),
            Some(Box::new(move || flag.store(true, std::sync::atomic::Ordering::SeqCst))),
        );
        pool.put(frame).unwrap();

        let mut reused = pool.get();
        reused.refill(Bytes::from_static(b"fresh"), Timestamp::from_micros(8), None);
        assert!(released.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!reused.has_pending_release());
        assert_eq!(reused.data(), b"fresh");
    }

    #[test]
    fn put_after_close_is_rejected() {
        let pool: FramePool<RawFrame> = FramePool::new();
        let frame = pool.get();
        pool.close();
        assert_eq!(pool.put(frame), Err(PoolError::Closed));
    }

    #[test]
    fn close_is_idempotent_and_clears() {
        let pool: FramePool<RawFrame> = FramePool::new();
        pool.put(Box::default()).unwrap();
        pool.put(Box::default()).unwrap();
        assert_eq!(pool.len(), 2);
        pool.close();
        pool.close();
        assert!(pool.is_closed());
        assert!(pool.is_empty());
    }

    #[test]
    fn max_idle_caps_retention() {
        let pool: FramePool<RawFrame> = FramePool::with_max_idle(1);
        pool.put(Box::default()).unwrap();
        pool.put(Box::default()).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn concurrent_get_put() {
        let pool: Arc<FramePool<RawFrame>> = Arc::new(FramePool::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        let mut frame = pool.get();
                        frame.refill(Bytes::from(vec![t as u8; 4]), Timestamp::from_micros(i), None);
                        assert_eq!(frame.data(), &[t as u8; 4]);
                        frame.release();
                        pool.put(frame).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.allocated + stats.reused, 400);
        assert!(stats.available <= 4);
    }
}
