//! Descriptor slots: the table through which handles are published to
//! callers.
//!
//! Allocation is two-phase to match the extraction protocol: a slot is
//! first reserved (with no handle lock held anywhere in the caller), then
//! either published with a handle or released. Exhaustion is a typed,
//! recoverable error.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{GlueError, Result};
use crate::handle::Handle;

/// Index of a descriptor slot.
pub type SlotId = u32;

enum Slot {
    Free,
    Reserved,
    Bound(Arc<Handle>),
}

/// Fixed-capacity table of descriptor slots.
pub struct DescriptorTable {
    slots: Mutex<Vec<Slot>>,
}

impl DescriptorTable {
    pub fn new(capacity: usize) -> DescriptorTable {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot::Free);
        DescriptorTable {
            slots: Mutex::new(slots),
        }
    }

    /// Reserve the lowest free slot.
    pub fn reserve(&self) -> Result<SlotId> {
        let mut slots = self.slots.lock();
        for (i, slot) in slots.iter_mut().enumerate() {
            if matches!(slot, Slot::Free) {
                *slot = Slot::Reserved;
                return Ok(i as SlotId);
            }
        }
        Err(GlueError::ResourceExhausted)
    }

    /// Publish a handle into a previously reserved slot. Publishing into a
    /// slot that was never reserved is a caller bug.
    pub fn publish(&self, slot: SlotId, handle: Arc<Handle>) {
        let mut slots = self.slots.lock();
        match slots.get_mut(slot as usize) {
            Some(s @ Slot::Reserved) => *s = Slot::Bound(handle),
            _ => panic!("descriptor {slot}: publish into unreserved slot"),
        }
    }

    /// Return a reserved or bound slot to the free pool.
    pub fn release(&self, slot: SlotId) {
        if let Some(s) = self.slots.lock().get_mut(slot as usize) {
            *s = Slot::Free;
        }
    }

    /// The handle published in `slot`, if any.
    pub fn get(&self, slot: SlotId) -> Option<Arc<Handle>> {
        match self.slots.lock().get(slot as usize) {
            Some(Slot::Bound(h)) => Some(h.clone()),
            _ => None,
        }
    }

    /// Clear `slot` if it still publishes `handle`. Reaper detach path.
    pub(crate) fn detach(&self, slot: SlotId, handle: &Arc<Handle>) {
        let mut slots = self.slots.lock();
        if let Some(s) = slots.get_mut(slot as usize) {
            if matches!(s, Slot::Bound(h) if Arc::ptr_eq(h, handle)) {
                *s = Slot::Free;
            }
        }
    }

    /// Number of slots not currently free.
    pub fn in_use(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| !matches!(s, Slot::Free))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_publish_get_release() {
        let table = DescriptorTable::new(2);
        let slot = table.reserve().unwrap();
        assert!(table.get(slot).is_none(), "reserved slot is not yet visible");

        let h = Handle::new(1);
        table.publish(slot, h.clone());
        assert!(Arc::ptr_eq(&table.get(slot).unwrap(), &h));

        table.release(slot);
        assert!(table.get(slot).is_none());
        assert_eq!(table.in_use(), 0);
    }

    #[test]
    fn reserve_exhausts_typed() {
        let table = DescriptorTable::new(1);
        let slot = table.reserve().unwrap();
        assert_eq!(table.reserve().unwrap_err(), GlueError::ResourceExhausted);
        table.release(slot);
        assert!(table.reserve().is_ok());
    }

    #[test]
    fn detach_only_clears_matching_handle() {
        let table = DescriptorTable::new(1);
        let slot = table.reserve().unwrap();
        let a = Handle::new(1);
        let b = Handle::new(2);
        table.publish(slot, a.clone());

        table.detach(slot, &b);
        assert!(table.get(slot).is_some(), "foreign handle must not clear the slot");
        table.detach(slot, &a);
        assert!(table.get(slot).is_none());
    }
}
