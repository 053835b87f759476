//! Buffer segments: the nodes of a packet chain.

use std::sync::Arc;

use bytes::Bytes;

use super::pool::{SegKind, SegmentPool};

/// Size of a pooled inline data block.
pub const SEG_BLOCK_SIZE: usize = 2048;

/// Packet-level metadata, present only on the first segment of a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    /// Declared total length of the whole chain in bytes.
    pub total_len: usize,
    /// Index of the interface the packet arrived on, if known.
    pub rcvif: Option<u32>,
}

/// Storage behind a segment's data window.
pub(crate) enum SegStore {
    /// Pool-owned fixed-size block. The window may slide backward into
    /// leading space for prepends.
    Inline(Box<[u8; SEG_BLOCK_SIZE]>),
    /// Shared immutable region. Cloning the handle bumps the region's
    /// reference count; the window is owned per segment.
    Shared(Bytes),
}

/// One node of a packet chain.
///
/// The (offset, length) window selects the live bytes inside the backing
/// storage. Dropping a segment returns its inline block to the pool it
/// came from and releases its reservation.
pub struct Segment {
    pub(crate) store: SegStore,
    off: usize,
    len: usize,
    hdr: Option<PacketHeader>,
    kind: SegKind,
    pool: Arc<SegmentPool>,
    pub(crate) next: Option<Box<Segment>>,
}

impl Segment {
    pub(crate) fn new_inline(pool: Arc<SegmentPool>, kind: SegKind, block: Box<[u8; SEG_BLOCK_SIZE]>) -> Box<Segment> {
        Box::new(Segment {
            store: SegStore::Inline(block),
            off: 0,
            len: 0,
            hdr: None,
            kind,
            pool,
            next: None,
        })
    }

    pub(crate) fn new_shared(pool: Arc<SegmentPool>, kind: SegKind, region: Bytes) -> Box<Segment> {
        let len = region.len();
        Box::new(Segment {
            store: SegStore::Shared(region),
            off: 0,
            len,
            hdr: None,
            kind,
            pool,
            next: None,
        })
    }

    /// Length of the data window.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the window is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Window offset into the backing storage.
    pub fn off(&self) -> usize {
        self.off
    }

    pub fn kind(&self) -> SegKind {
        self.kind
    }

    /// The live bytes of this segment.
    pub fn data(&self) -> &[u8] {
        match &self.store {
            SegStore::Inline(b) => &b[self.off..self.off + self.len],
            SegStore::Shared(b) => &b[self.off..self.off + self.len],
        }
    }

    /// Mutable access to the live bytes. Shared storage is immutable;
    /// writing to it is a caller bug.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.store {
            SegStore::Inline(b) => &mut b[self.off..self.off + self.len],
            SegStore::Shared(_) => panic!("segment: write into shared storage"),
        }
    }

    /// True when this segment owns a writable inline block.
    pub fn is_inline(&self) -> bool {
        matches!(self.store, SegStore::Inline(_))
    }

    /// Size of the shared backing region, when there is one.
    pub fn shared_region_len(&self) -> Option<usize> {
        match &self.store {
            SegStore::Shared(b) => Some(b.len()),
            SegStore::Inline(_) => None,
        }
    }

    /// Unused space in front of the window. Shared regions cannot grow
    /// backward, so they report none.
    pub fn leading_space(&self) -> usize {
        match self.store {
            SegStore::Inline(_) => self.off,
            SegStore::Shared(_) => 0,
        }
    }

    /// Grow the window backward into leading space.
    pub fn extend_front(&mut self, n: usize) {
        assert!(self.leading_space() >= n, "segment: no leading space for {n} bytes");
        self.off -= n;
        self.len += n;
    }

    /// Shrink the window from the front.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len, "segment: advance {n} past window of {}", self.len);
        self.off += n;
        self.len -= n;
    }

    /// Place the window at an explicit (offset, length).
    pub fn set_window(&mut self, off: usize, len: usize) {
        let cap = match &self.store {
            SegStore::Inline(_) => SEG_BLOCK_SIZE,
            SegStore::Shared(b) => b.len(),
        };
        assert!(off + len <= cap, "segment: window {off}+{len} exceeds storage of {cap}");
        self.off = off;
        self.len = len;
    }

    /// Copy bytes into the inline block at the current offset and size the
    /// window to them.
    pub fn copy_in(&mut self, data: &[u8]) {
        match &mut self.store {
            SegStore::Inline(b) => {
                b[self.off..self.off + data.len()].copy_from_slice(data);
                self.len = data.len();
            }
            SegStore::Shared(_) => panic!("segment: copy into shared storage"),
        }
    }

    pub fn header(&self) -> Option<&PacketHeader> {
        self.hdr.as_ref()
    }

    pub fn header_mut(&mut self) -> Option<&mut PacketHeader> {
        self.hdr.as_mut()
    }

    pub fn set_header(&mut self, hdr: PacketHeader) {
        self.hdr = Some(hdr);
    }

    /// Remove and return the packet header, leaving this segment an
    /// ordinary data node.
    pub fn take_header(&mut self) -> Option<PacketHeader> {
        self.hdr.take()
    }

    /// Duplicate `take` bytes starting at `local_off` within this segment's
    /// window. Shared storage is duplicated by view (no byte copy); inline
    /// storage is copied into a fresh block.
    pub(crate) fn dup_range(
        &self,
        pool: &Arc<SegmentPool>,
        mode: super::pool::AllocMode,
        local_off: usize,
        take: usize,
    ) -> Option<Box<Segment>> {
        match &self.store {
            SegStore::Shared(region) => {
                let mut n = pool.alloc_shared(mode, self.kind, region.clone())?;
                n.set_window(self.off + local_off, take);
                Some(n)
            }
            SegStore::Inline(_) => {
                let mut n = pool.alloc(mode, self.kind)?;
                n.copy_in(&self.data()[local_off..local_off + take]);
                Some(n)
            }
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let store = std::mem::replace(&mut self.store, SegStore::Shared(Bytes::new()));
        self.pool.recycle(store, self.kind);
        // unlink the tail iteratively so long chains cannot overflow the
        // stack with recursive drops
        let mut next = self.next.take();
        while let Some(mut seg) = next {
            next = seg.next.take();
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("len", &self.len)
            .field("off", &self.off)
            .field("kind", &self.kind)
            .field("inline", &self.is_inline())
            .field("hdr", &self.hdr)
            .finish()
    }
}
