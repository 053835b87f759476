//! Extraction (peel-off): detaching one ready sub-connection from a
//! listening handle into an independently addressable handle.
//!
//! The protocol runs in three named phases so the lock discipline is
//! structural rather than ad hoc:
//!
//! 1. **validate**, under the listening lock: resolve, policy check,
//!    eligibility check.
//! 2. **reserve**, with no handle lock held: allocate the destination
//!    descriptor slot. Slot allocation and handle locks must never nest,
//!    or this path deadlocks against a concurrent readiness wait on the
//!    same listening handle; the reserve function cannot even see a lock
//!    guard.
//! 3. **commit**, re-locked: extract the sub-connection, clear its
//!    pending flags, detach it from the backlog, publish it.
//!
//! Lock acquisition order is always listening handle first, then the new
//! handle, never the reverse. A failed slot reservation leaves the
//! sub-connection queued for the next attempt.

use std::sync::Arc;

use tracing::debug;

use crate::descriptor::{DescriptorTable, SlotId};
use crate::engine::{AccessPolicy, ProtocolEngine};
use crate::error::{GlueError, Result};
use crate::handle::{AssocId, Handle};

/// Peel `assoc` off the listening handle published at `listener_sd` and
/// return the descriptor slot publishing the new handle.
pub fn peel_off(
    descriptors: &DescriptorTable,
    engine: &dyn ProtocolEngine,
    policy: &dyn AccessPolicy,
    listener_sd: SlotId,
    assoc: AssocId,
) -> Result<SlotId> {
    let listener = descriptors
        .get(listener_sd)
        .ok_or(GlueError::BadHandle(listener_sd))?;

    validate(engine, policy, &listener, assoc)?;

    let slot = match reserve_slot(descriptors) {
        Ok(slot) => slot,
        Err(e) => {
            // balance the lock state the caller observes before failing;
            // the sub-connection stays queued for a later attempt
            let g = listener.acquire(false);
            g.release(false);
            return Err(e);
        }
    };

    match commit(engine, policy, &listener, assoc, slot, descriptors) {
        Ok(()) => {
            debug!(listener = listener.id(), assoc, slot, "peeled off sub-connection");
            Ok(slot)
        }
        Err(e) => {
            descriptors.release(slot);
            Err(e)
        }
    }
}

/// Phase 1: everything that must be checked under the listening lock.
fn validate(
    engine: &dyn ProtocolEngine,
    policy: &dyn AccessPolicy,
    listener: &Arc<Handle>,
    assoc: AssocId,
) -> Result<()> {
    let g = listener.acquire(false);
    let res = policy
        .check_accept(&g)
        .and_then(|()| engine.can_extract(&g, assoc));
    g.release(false);
    res
}

/// Phase 2: slot reservation. Takes only the descriptor table, no handle
/// and no guard, so holding a handle lock across it is impossible to
/// write.
fn reserve_slot(descriptors: &DescriptorTable) -> Result<SlotId> {
    descriptors.reserve()
}

/// Phase 3: extract and publish under the listening lock.
fn commit(
    engine: &dyn ProtocolEngine,
    policy: &dyn AccessPolicy,
    listener: &Arc<Handle>,
    assoc: AssocId,
    slot: SlotId,
    descriptors: &DescriptorTable,
) -> Result<()> {
    let mut g = listener.acquire(false);

    // the connection primitive shared with the accept path refuses handles
    // that do not look listen-ready, so present a capacity of at least one
    // for exactly the duration of the call
    let extracted = g.with_backlog_floor(1, |g| engine.extract_subconnection(g, assoc));
    let new_handle = match extracted {
        Ok(h) => h,
        Err(e) => {
            g.release(false);
            return Err(e);
        }
    };

    if let Err(e) = policy.check_accepted(&new_handle) {
        g.backlog.retain(|h| !Arc::ptr_eq(h, &new_handle));
        g.release(false);
        close_extracted(&new_handle);
        return Err(e);
    }

    {
        // lock order: listening handle, then the new handle
        let mut ng = new_handle.acquire(false);
        ng.pending_completion = false;
        ng.no_descriptor_ref = false;
        ng.listener = None;
        ng.descriptor = Some(slot);
        ng.release(false);
    }

    g.backlog.retain(|h| !Arc::ptr_eq(h, &new_handle));
    g.release(false);

    descriptors.publish(slot, new_handle);
    Ok(())
}

/// A handle extracted but refused at publication time is closed, not
/// returned to the backlog.
fn close_extracted(handle: &Arc<Handle>) {
    {
        let mut g = handle.acquire(false);
        g.pending_completion = false;
        g.no_descriptor_ref = false;
        g.listener = None;
        g.release(false);
    }
    handle.mark_for_teardown();
}
