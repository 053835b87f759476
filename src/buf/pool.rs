//! Segment pool: a lock-protected free list of inline data blocks with a
//! cap on outstanding segments.
//!
//! Every segment allocation, inline or shared-view, takes a reservation
//! against the cap so exhaustion is observable and testable. Blocking
//! callers park on a condvar until another thread releases a segment;
//! non-blocking callers get `None` at the cap and must discard whatever
//! partial chain they were building.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::segment::{SegStore, Segment, SEG_BLOCK_SIZE};

/// Blocking behavior of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    /// Park until a segment is released when the pool is at its cap.
    Wait,
    /// Fail immediately at the cap.
    DontWait,
}

/// Accounting class of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegKind {
    /// Ordinary payload data.
    Data,
    /// Synthesized network-layer headers.
    Header,
}

struct FreeState {
    blocks: Vec<Box<[u8; SEG_BLOCK_SIZE]>>,
    outstanding: usize,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Live segments of kind [`SegKind::Data`].
    pub data_segments: usize,
    /// Live segments of kind [`SegKind::Header`].
    pub header_segments: usize,
    /// Total live segments counted against the cap.
    pub outstanding: usize,
    /// Recycled inline blocks waiting for reuse.
    pub free_blocks: usize,
}

/// Shared pool of buffer segments.
pub struct SegmentPool {
    state: Mutex<FreeState>,
    released: Condvar,
    limit: usize,
    data_gauge: AtomicUsize,
    header_gauge: AtomicUsize,
}

impl SegmentPool {
    /// Create a pool allowing at most `limit` outstanding segments.
    pub fn new(limit: usize) -> Arc<SegmentPool> {
        Arc::new(SegmentPool {
            state: Mutex::new(FreeState {
                blocks: Vec::new(),
                outstanding: 0,
            }),
            released: Condvar::new(),
            limit,
            data_gauge: AtomicUsize::new(0),
            header_gauge: AtomicUsize::new(0),
        })
    }

    /// Allocate a segment with a writable inline block.
    pub fn alloc(self: &Arc<Self>, mode: AllocMode, kind: SegKind) -> Option<Box<Segment>> {
        let block = self.take_block(mode)?;
        self.gauge(kind).fetch_add(1, Ordering::Relaxed);
        Some(Segment::new_inline(self.clone(), kind, block))
    }

    /// Allocate a segment viewing an existing shared region. The whole
    /// region is the initial window; callers narrow it as needed.
    pub fn alloc_shared(self: &Arc<Self>, mode: AllocMode, kind: SegKind, region: Bytes) -> Option<Box<Segment>> {
        if !self.reserve(mode) {
            return None;
        }
        self.gauge(kind).fetch_add(1, Ordering::Relaxed);
        Some(Segment::new_shared(self.clone(), kind, region))
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PoolStats {
        let st = self.state.lock();
        PoolStats {
            data_segments: self.data_gauge.load(Ordering::Relaxed),
            header_segments: self.header_gauge.load(Ordering::Relaxed),
            outstanding: st.outstanding,
            free_blocks: st.blocks.len(),
        }
    }

    fn gauge(&self, kind: SegKind) -> &AtomicUsize {
        match kind {
            SegKind::Data => &self.data_gauge,
            SegKind::Header => &self.header_gauge,
        }
    }

    /// Take a reservation and an inline block, blocking per `mode`.
    fn take_block(&self, mode: AllocMode) -> Option<Box<[u8; SEG_BLOCK_SIZE]>> {
        let mut st = self.state.lock();
        loop {
            if st.outstanding < self.limit {
                st.outstanding += 1;
                // fresh allocation is the slow path when the free list is dry
                return Some(st.blocks.pop().unwrap_or_else(|| {
                    trace!("segment pool: free list empty, allocating fresh block");
                    Box::new([0u8; SEG_BLOCK_SIZE])
                }));
            }
            match mode {
                AllocMode::DontWait => return None,
                AllocMode::Wait => {
                    self.released.wait(&mut st);
                }
            }
        }
    }

    /// Take a reservation only (shared-view segments carry no block).
    fn reserve(&self, mode: AllocMode) -> bool {
        let mut st = self.state.lock();
        loop {
            if st.outstanding < self.limit {
                st.outstanding += 1;
                return true;
            }
            match mode {
                AllocMode::DontWait => return false,
                AllocMode::Wait => {
                    self.released.wait(&mut st);
                }
            }
        }
    }

    /// Return a dropped segment's storage and reservation.
    pub(crate) fn recycle(&self, store: SegStore, kind: SegKind) {
        self.gauge(kind).fetch_sub(1, Ordering::Relaxed);
        let mut st = self.state.lock();
        st.outstanding -= 1;
        if let SegStore::Inline(block) = store {
            st.blocks.push(block);
        }
        drop(st);
        self.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn alloc_and_recycle_updates_counters() {
        let pool = SegmentPool::new(8);
        let a = pool.alloc(AllocMode::DontWait, SegKind::Data).unwrap();
        let b = pool.alloc(AllocMode::DontWait, SegKind::Header).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.data_segments, 1);
        assert_eq!(stats.header_segments, 1);
        assert_eq!(stats.outstanding, 2);

        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.data_segments, 0);
        assert_eq!(stats.header_segments, 0);
        // inline blocks came back for reuse
        assert_eq!(stats.free_blocks, 2);
    }

    #[test]
    fn nonblocking_alloc_fails_at_cap() {
        let pool = SegmentPool::new(1);
        let held = pool.alloc(AllocMode::DontWait, SegKind::Data).unwrap();
        assert!(pool.alloc(AllocMode::DontWait, SegKind::Data).is_none());
        drop(held);
        assert!(pool.alloc(AllocMode::DontWait, SegKind::Data).is_some());
    }

    #[test]
    fn blocking_alloc_waits_for_release() {
        let pool = SegmentPool::new(1);
        let held = pool.alloc(AllocMode::DontWait, SegKind::Data).unwrap();

        let pool2 = pool.clone();
        let waiter = std::thread::spawn(move || {
            // parks until the main thread drops its segment
            pool2.alloc(AllocMode::Wait, SegKind::Data).unwrap()
        });

        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        let seg = waiter.join().unwrap();
        assert_eq!(pool.stats().outstanding, 1);
        drop(seg);
    }

    #[test]
    fn shared_segments_count_against_cap() {
        let pool = SegmentPool::new(1);
        let region = bytes::Bytes::from_static(b"abc");
        let held = pool.alloc_shared(AllocMode::DontWait, SegKind::Data, region.clone()).unwrap();
        assert!(pool.alloc_shared(AllocMode::DontWait, SegKind::Data, region).is_none());
        drop(held);
        assert_eq!(pool.stats().outstanding, 0);
    }
}
