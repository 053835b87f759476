//! Chain operations: duplication over an offset/length window, header
//! prepending, and front trimming.
//!
//! ## Duplication
//! ```text
//! source:   [hdr|seg0][seg1........][seg2]
//!                 |--- window (off, len) ---|
//! output:   [hdr'|view/copy][view/copy][view/copy]
//! ```
//! Segments backed by a shared region are duplicated by adding a view with
//! an adjusted offset; inline segments are copied byte-for-byte. The source
//! chain is never touched. A partially built output never escapes: any
//! mid-walk allocation failure releases it and reports exhaustion.

use std::sync::Arc;

use tracing::trace;

use super::pool::{AllocMode, SegKind, SegmentPool};
use super::segment::{PacketHeader, Segment, SEG_BLOCK_SIZE};

/// Number of bytes a copy or trim may span: either a finite count or the
/// remainder-of-chain sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyLen {
    /// Everything remaining in the source past the offset.
    All,
    /// Exactly this many bytes.
    Exact(usize),
}

/// An owned, ordered sequence of buffer segments. Zero segments is a valid
/// (empty) chain.
#[derive(Default)]
pub struct Chain {
    head: Option<Box<Segment>>,
}

impl Chain {
    /// The empty chain.
    pub fn empty() -> Chain {
        Chain { head: None }
    }

    /// A chain of one segment.
    pub fn from_segment(seg: Box<Segment>) -> Chain {
        Chain { head: Some(seg) }
    }

    /// Relink a vector of unlinked segments, in order, into a chain.
    fn from_parts(mut parts: Vec<Box<Segment>>) -> Chain {
        let mut head = None;
        while let Some(mut seg) = parts.pop() {
            seg.next = head;
            head = Some(seg);
        }
        Chain { head }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Sum of all segment window lengths.
    pub fn len(&self) -> usize {
        self.iter().map(Segment::len).sum()
    }

    /// Iterate the segments front to back.
    pub fn iter(&self) -> SegIter<'_> {
        SegIter {
            cur: self.head.as_deref(),
        }
    }

    pub fn first(&self) -> Option<&Segment> {
        self.head.as_deref()
    }

    pub fn first_mut(&mut self) -> Option<&mut Segment> {
        self.head.as_deref_mut()
    }

    /// The chain's packet header, carried by the first segment when present.
    pub fn header(&self) -> Option<&PacketHeader> {
        self.head.as_deref().and_then(Segment::header)
    }

    /// Append a segment at the tail.
    pub fn push_back(&mut self, seg: Box<Segment>) {
        let mut slot = &mut self.head;
        while let Some(s) = slot {
            slot = &mut s.next;
        }
        *slot = Some(seg);
    }

    /// Link another chain behind this one.
    pub fn append(&mut self, other: Chain) {
        let mut other = other;
        if let Some(head) = other.head.take() {
            self.push_back(head);
        }
    }

    /// Copy all live bytes into one contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for seg in self.iter() {
            out.extend_from_slice(seg.data());
        }
        out
    }

    /// One line per segment, for trace logging.
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for (i, seg) in self.iter().enumerate() {
            let _ = write!(out, "seg {i}: len={} off={}", seg.len(), seg.off());
            if let Some(ext) = seg.shared_region_len() {
                let _ = write!(out, " ext_size={ext}");
            }
            if let Some(hdr) = seg.header() {
                let _ = write!(out, " hdr_total={}", hdr.total_len);
            }
            out.push('\n');
        }
        out
    }

    /// Migrate a word of bytes from the second segment into an empty
    /// header-bearing head, so code that expects header bytes in the head
    /// segment finds them there. No-op for every other shape.
    pub fn fix_header_segment(&mut self) {
        const MIGRATE: usize = std::mem::size_of::<u32>();
        let Some(head) = self.head.as_deref_mut() else {
            return;
        };
        if head.header().is_none() || head.len() != 0 || !head.is_inline() {
            return;
        }
        let moved: [u8; MIGRATE] = {
            let Some(next) = head.next.as_deref() else {
                return;
            };
            if next.len() <= MIGRATE {
                return;
            }
            next.data()[..MIGRATE].try_into().unwrap()
        };
        head.copy_in(&moved);
        head.next.as_deref_mut().unwrap().advance(MIGRATE);
    }

    /// Duplicate `len` bytes starting at `off` into a new chain sharing
    /// storage with this one wherever the source is a shared region.
    ///
    /// When `off == 0` and this chain carries a packet header, the output
    /// head gets a copy of it with the total adjusted: set to `len` for an
    /// exact request, or reduced by the consumed offset for [`CopyLen::All`].
    ///
    /// Panics when the request spans bytes the chain does not have; that is
    /// a caller contract violation, not a recoverable failure. Allocation
    /// exhaustion releases the partial output and returns
    /// [`GlueError::NoBufs`](crate::GlueError::NoBufs).
    pub fn duplicate(
        &self,
        off0: usize,
        len: CopyLen,
        pool: &Arc<SegmentPool>,
        mode: AllocMode,
    ) -> crate::Result<Chain> {
        let mut copyhdr = off0 == 0 && self.header().is_some();
        let src_total = self.header().map(|h| h.total_len);

        // find the segment containing the starting offset
        let mut off = off0;
        let mut cur = self.head.as_deref();
        while let Some(seg) = cur {
            if off < seg.len() {
                break;
            }
            off -= seg.len();
            cur = seg.next.as_deref();
        }
        if cur.is_none() && off > 0 {
            panic!("chain duplicate: offset {off0} beyond end of chain");
        }

        let mut remaining = match len {
            CopyLen::All => usize::MAX,
            CopyLen::Exact(n) => n,
        };
        let mut parts: Vec<Box<Segment>> = Vec::new();
        while remaining > 0 {
            let Some(seg) = cur else {
                match len {
                    CopyLen::All => break,
                    CopyLen::Exact(_) => panic!(
                        "chain duplicate: {remaining} requested bytes past end of chain"
                    ),
                }
            };
            let take = remaining.min(seg.len() - off);
            let Some(mut n) = seg.dup_range(pool, mode, off, take) else {
                // parts drops here, releasing every segment built so far
                return Err(crate::GlueError::NoBufs);
            };
            if copyhdr {
                let mut hdr = self.header().cloned().unwrap();
                hdr.total_len = match len {
                    CopyLen::All => src_total.unwrap().saturating_sub(off0),
                    CopyLen::Exact(want) => want,
                };
                n.set_header(hdr);
                copyhdr = false;
            }
            parts.push(n);
            if let CopyLen::Exact(_) = len {
                remaining -= take;
            }
            off = 0;
            cur = seg.next.as_deref();
        }
        Ok(Chain::from_parts(parts))
    }

    /// Put `len` bytes of headroom in front of the chain.
    ///
    /// Fast path: the first segment has enough leading space and grows
    /// backward in place. Slow path: one new segment is allocated, takes
    /// over the packet header (a chain has exactly one header-bearing
    /// segment), and is linked in front with its window placed at the tail
    /// of the block so the next prepend hits the fast path.
    ///
    /// On allocation failure the original chain is released; callers must
    /// not assume it survives.
    pub fn prepend(
        mut self,
        len: usize,
        pool: &Arc<SegmentPool>,
        mode: AllocMode,
    ) -> crate::Result<Chain> {
        assert!(len <= SEG_BLOCK_SIZE, "chain prepend: {len} exceeds block size");

        if let Some(head) = self.head.as_deref_mut() {
            if head.leading_space() >= len {
                head.extend_front(len);
                if let Some(hdr) = head.header_mut() {
                    hdr.total_len += len;
                }
                return Ok(self);
            }
        }

        let Some(mut seg) = pool.alloc(mode, SegKind::Header) else {
            trace!("chain prepend: allocation failed, releasing chain");
            return Err(crate::GlueError::NoBufs);
        };
        if let Some(old_head) = self.head.as_deref_mut() {
            if let Some(hdr) = old_head.take_header() {
                seg.set_header(hdr);
            }
        }
        // window at the aligned tail of the block leaves headroom for
        // later prepends
        let off = (SEG_BLOCK_SIZE - len) & !(std::mem::size_of::<usize>() - 1);
        seg.set_window(off, len);
        if let Some(hdr) = seg.header_mut() {
            hdr.total_len += len;
        }
        seg.next = self.head.take();
        Ok(Chain { head: Some(seg) })
    }

    /// Strip `n` bytes from the front of the chain, dropping emptied
    /// segments and carrying the packet header (with its total reduced) to
    /// the surviving head.
    pub fn trim_front(&mut self, mut n: usize) {
        if let Some(hdr) = self.head.as_deref_mut().and_then(Segment::header_mut) {
            hdr.total_len = hdr.total_len.saturating_sub(n);
        }
        while n > 0 {
            let Some(head) = self.head.as_deref_mut() else {
                return;
            };
            if head.len() > n {
                head.advance(n);
                return;
            }
            n -= head.len();
            let mut old = self.head.take().unwrap();
            let hdr = old.take_header();
            self.head = old.next.take();
            if let (Some(hdr), Some(new_head)) = (hdr, self.head.as_deref_mut()) {
                new_head.set_header(hdr);
            }
        }
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        // unlink iteratively; Segment::drop handles its own tail the same way
        let mut cur = self.head.take();
        while let Some(mut seg) = cur {
            cur = seg.next.take();
        }
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("segments", &self.iter().count())
            .field("len", &self.len())
            .field("hdr", &self.header())
            .finish()
    }
}

/// Front-to-back segment iterator.
pub struct SegIter<'a> {
    cur: Option<&'a Segment>,
}

impl<'a> Iterator for SegIter<'a> {
    type Item = &'a Segment;

    fn next(&mut self) -> Option<&'a Segment> {
        let seg = self.cur?;
        self.cur = seg.next.as_deref();
        Some(seg)
    }
}
