//! Packet buffer chains.
//!
//! Packet data moves through the glue layer as singly linked chains of
//! fixed-size segments. A segment either owns its bytes in a pooled inline
//! block or holds a reference-counted view into a shared immutable region,
//! so duplicating a chain adds views instead of copying payload bytes.
//! Only the first segment of a chain carries packet-level metadata.

mod chain;
mod pool;
mod segment;

pub use chain::{Chain, CopyLen};
pub use pool::{AllocMode, PoolStats, SegKind, SegmentPool};
pub use segment::{PacketHeader, Segment, SEG_BLOCK_SIZE};
