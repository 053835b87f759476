//! Resource handles: the per-association control structure with its lock,
//! use-count, and post-mortem lock diagnostics.
//!
//! Every handle pairs an exclusive critical-section lock with a use-count
//! of callers currently operating on it. The lock must be held to mutate
//! the count, and the count never goes negative: driving it negative, or
//! acquiring a handle whose control block has been detached, is a lifecycle
//! bug elsewhere and panics with the recorded diagnostics instead of
//! limping on with corrupt state.
//!
//! There is no deadlock detection here. What the handle does keep is enough
//! state to diagnose an ordering violation after the fact: the three most
//! recent lock and unlock call sites and a pair of generation counters fed
//! from one per-handle sequence, stamped on every lock and unlock.

pub mod reaper;
pub mod table;

use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::descriptor::SlotId;

/// Identifier of one association within a listening endpoint.
pub type AssocId = u32;

/// Lifecycle state of a handle's control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// In service.
    Active,
    /// Teardown requested; new work must not start.
    MarkedForTeardown,
    /// Fully quiesced; eligible for the reaper once unreferenced.
    Dead,
}

/// Ring of the three most recent call sites, newest first.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallerRing {
    slots: [Option<&'static Location<'static>>; 3],
}

impl CallerRing {
    fn record(&mut self, loc: &'static Location<'static>) {
        self.slots[2] = self.slots[1];
        self.slots[1] = self.slots[0];
        self.slots[0] = Some(loc);
    }

    /// Recorded sites, newest first.
    pub fn sites(&self) -> [Option<&'static Location<'static>>; 3] {
        self.slots
    }
}

/// State guarded by the handle's critical-section lock.
pub struct ControlBlock {
    pub state: HandleState,
    use_count: i32,
    gen: u64,
    lock_gen: u64,
    unlock_gen: u64,
    lock_callers: CallerRing,
    unlock_callers: CallerRing,
    /// Ready sub-connections queued on a listening handle.
    pub backlog: Vec<Arc<Handle>>,
    /// Listen queue capacity presented to the connection primitive.
    pub backlog_cap: usize,
    /// Sub-connection still waiting for handshake completion delivery.
    pub pending_completion: bool,
    /// Sub-connection not yet published into a descriptor slot.
    pub no_descriptor_ref: bool,
    /// The listening handle this one is still attached to, if any.
    pub listener: Option<Weak<Handle>>,
    /// Association this handle was created for, when known.
    pub assoc_id: Option<AssocId>,
    /// Descriptor slot currently publishing this handle.
    pub descriptor: Option<SlotId>,
}

impl ControlBlock {
    fn new() -> ControlBlock {
        ControlBlock {
            state: HandleState::Active,
            use_count: 0,
            gen: 0,
            lock_gen: 0,
            unlock_gen: 0,
            lock_callers: CallerRing::default(),
            unlock_callers: CallerRing::default(),
            backlog: Vec::new(),
            backlog_cap: 0,
            pending_completion: false,
            no_descriptor_ref: false,
            listener: None,
            assoc_id: None,
            descriptor: None,
        }
    }

    pub fn use_count(&self) -> i32 {
        self.use_count
    }

    /// Sequence value stamped at the most recent lock.
    pub fn lock_gen(&self) -> u64 {
        self.lock_gen
    }

    /// Sequence value stamped at the most recent unlock.
    pub fn unlock_gen(&self) -> u64 {
        self.unlock_gen
    }

    pub fn lock_callers(&self) -> &CallerRing {
        &self.lock_callers
    }

    pub fn unlock_callers(&self) -> &CallerRing {
        &self.unlock_callers
    }
}

static NEXT_THREAD_TAG: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TAG: u64 = NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed);
}

fn thread_tag() -> u64 {
    THREAD_TAG.with(|t| *t)
}

/// One endpoint or association's kernel-side resources.
pub struct Handle {
    id: u64,
    /// Fast teardown mark readable without the lock; the reaper filters on
    /// it before attempting a non-blocking acquire.
    teardown: AtomicBool,
    /// Tag of the thread currently inside the critical section, 0 if none.
    owner: AtomicU64,
    ctrl: Mutex<Option<ControlBlock>>,
}

impl Handle {
    pub fn new(id: u64) -> Arc<Handle> {
        Arc::new(Handle {
            id,
            teardown: AtomicBool::new(false),
            owner: AtomicU64::new(0),
            ctrl: Mutex::new(Some(ControlBlock::new())),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// True once teardown has been requested.
    pub fn teardown_requested(&self) -> bool {
        self.teardown.load(Ordering::Acquire)
    }

    /// Enter the critical section, blocking until the lock is free, and
    /// optionally take a reference. Acquiring a handle whose control block
    /// has been detached is fatal: it means a caller outlived the handle's
    /// lifecycle.
    #[track_caller]
    pub fn acquire(&self, add_ref: bool) -> HandleGuard<'_> {
        let caller = Location::caller();
        self.assert_not_held();
        let mut inner = self.ctrl.lock();
        {
            let Some(cb) = inner.as_mut() else {
                panic!("handle {}: acquire with no control block", self.id);
            };
            if cb.use_count < 0 {
                panic!(
                    "handle {}: use-count {} negative on acquire, lock sites {:?}",
                    self.id, cb.use_count, cb.lock_callers
                );
            }
            if add_ref {
                cb.use_count += 1;
            }
            cb.lock_callers.record(caller);
            cb.lock_gen = cb.gen;
            cb.gen += 1;
        }
        self.owner.store(thread_tag(), Ordering::Release);
        HandleGuard {
            handle: self,
            inner: Some(inner),
        }
    }

    /// Like [`acquire`](Handle::acquire) but gives up instead of blocking
    /// when the lock is contended. The reaper's sweep stays bounded this
    /// way.
    #[track_caller]
    pub fn try_acquire(&self, add_ref: bool) -> Option<HandleGuard<'_>> {
        let caller = Location::caller();
        let mut inner = self.ctrl.try_lock()?;
        {
            let Some(cb) = inner.as_mut() else {
                panic!("handle {}: acquire with no control block", self.id);
            };
            if add_ref {
                cb.use_count += 1;
            }
            cb.lock_callers.record(caller);
            cb.lock_gen = cb.gen;
            cb.gen += 1;
        }
        self.owner.store(thread_tag(), Ordering::Release);
        Some(HandleGuard {
            handle: self,
            inner: Some(inner),
        })
    }

    /// Fatal unless the calling thread is inside this handle's critical
    /// section.
    pub fn assert_held(&self) {
        if self.owner.load(Ordering::Acquire) != thread_tag() {
            panic!("handle {}: lock not held by this thread", self.id);
        }
    }

    /// Fatal if the calling thread is inside this handle's critical
    /// section.
    pub fn assert_not_held(&self) {
        if self.owner.load(Ordering::Acquire) == thread_tag() {
            panic!("handle {}: lock already held by this thread", self.id);
        }
    }

    /// Request teardown: no new work starts, and the reaper will collect
    /// the handle once it is quiesced and unreferenced.
    #[track_caller]
    pub fn mark_for_teardown(&self) {
        let mut g = self.acquire(false);
        if g.state == HandleState::Active {
            g.state = HandleState::MarkedForTeardown;
        }
        self.teardown.store(true, Ordering::Release);
        g.release(false);
    }

    /// Mark the handle fully quiesced. Normally the protocol engine's
    /// teardown path gets a handle here.
    #[track_caller]
    pub fn set_dead(&self) {
        let mut g = self.acquire(false);
        g.state = HandleState::Dead;
        self.teardown.store(true, Ordering::Release);
        g.release(false);
    }

    /// Detach the control block and leave the critical section. Reaper-only:
    /// after this, any further acquire of the handle is fatal, which is
    /// exactly the property that makes use-after-teardown observable.
    pub(crate) fn detach_control_block(&self, mut guard: HandleGuard<'_>) -> ControlBlock {
        assert!(std::ptr::eq(guard.handle, self));
        let mut inner = guard.inner.take().expect("handle guard already released");
        let cb = inner.take().expect("handle: control block already detached");
        self.owner.store(0, Ordering::Release);
        cb
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("teardown", &self.teardown_requested())
            .finish()
    }
}

/// Exclusive access to a handle's control block. Dropping the guard leaves
/// the critical section without touching the use-count; use
/// [`release`](HandleGuard::release) to drop a reference on the way out.
pub struct HandleGuard<'a> {
    handle: &'a Handle,
    inner: Option<MutexGuard<'a, Option<ControlBlock>>>,
}

impl<'a> HandleGuard<'a> {
    /// Leave the critical section, optionally dropping a reference first.
    /// Driving the use-count negative is fatal.
    #[track_caller]
    pub fn release(mut self, drop_ref: bool) {
        self.finish(drop_ref, Location::caller());
    }

    /// The handle this guard locks.
    pub fn handle(&self) -> &'a Handle {
        self.handle
    }

    /// Run `f` with the listen queue capacity raised to at least `floor`,
    /// restoring the original capacity afterward. The connection primitive
    /// shared with the accept path refuses handles that do not look
    /// listen-ready; extraction satisfies it through this scope.
    pub fn with_backlog_floor<R>(&mut self, floor: usize, f: impl FnOnce(&mut Self) -> R) -> R {
        let saved = self.backlog_cap;
        if self.backlog_cap < floor {
            self.backlog_cap = floor;
        }
        let out = f(self);
        self.backlog_cap = saved;
        out
    }

    fn finish(&mut self, drop_ref: bool, caller: &'static Location<'static>) {
        let mut inner = self.inner.take().expect("handle guard finished twice");
        {
            let cb = inner
                .as_mut()
                .expect("handle: control block detached while locked");
            cb.unlock_callers.record(caller);
            cb.unlock_gen = cb.gen;
            cb.gen += 1;
            if drop_ref {
                cb.use_count -= 1;
                if cb.use_count < 0 {
                    panic!(
                        "handle {}: use-count went negative ({}), lock sites {:?}, unlock sites {:?}",
                        self.handle.id, cb.use_count, cb.lock_callers, cb.unlock_callers
                    );
                }
            }
        }
        self.handle.owner.store(0, Ordering::Release);
        // inner drops here, leaving the critical section
    }
}

impl std::ops::Deref for HandleGuard<'_> {
    type Target = ControlBlock;

    fn deref(&self) -> &ControlBlock {
        self.inner
            .as_ref()
            .expect("handle guard already released")
            .as_ref()
            .expect("handle: control block detached while locked")
    }
}

impl std::ops::DerefMut for HandleGuard<'_> {
    fn deref_mut(&mut self) -> &mut ControlBlock {
        self.inner
            .as_mut()
            .expect("handle guard already released")
            .as_mut()
            .expect("handle: control block detached while locked")
    }
}

impl Drop for HandleGuard<'_> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.finish(false, Location::caller());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_balances_use_count() {
        let h = Handle::new(1);
        let before = {
            let g = h.acquire(false);
            let count = g.use_count();
            g.release(false);
            count
        };

        let g = h.acquire(true);
        assert_eq!(g.use_count(), before + 1);
        g.release(true);

        let g = h.acquire(false);
        assert_eq!(g.use_count(), before);
        g.release(false);
    }

    #[test]
    #[should_panic(expected = "use-count went negative")]
    fn extra_release_is_fatal() {
        let h = Handle::new(2);
        let g = h.acquire(false);
        g.release(true); // never referenced: count goes to -1
    }

    #[test]
    fn generation_counters_advance_per_lock_cycle() {
        let h = Handle::new(3);
        let g = h.acquire(false);
        let first_lock = g.lock_gen();
        g.release(false);

        let g = h.acquire(false);
        let (lock, unlock) = (g.lock_gen(), g.unlock_gen());
        g.release(false);

        assert!(lock > first_lock);
        assert!(unlock > first_lock, "unlock stamped between the two locks");
        assert_eq!(lock, unlock + 1);
    }

    #[test]
    fn caller_rings_keep_three_most_recent_sites() {
        let h = Handle::new(4);
        for _ in 0..4 {
            let g = h.acquire(false);
            g.release(false);
        }
        let g = h.acquire(false);
        let sites = g.lock_callers().sites();
        assert!(sites.iter().all(Option::is_some));
        g.release(false);
    }

    #[test]
    fn asserts_reflect_ownership() {
        let h = Handle::new(5);
        h.assert_not_held();
        let g = h.acquire(false);
        h.assert_held();
        g.release(false);
        h.assert_not_held();
    }

    #[test]
    #[should_panic(expected = "lock not held")]
    fn assert_held_without_lock_is_fatal() {
        let h = Handle::new(6);
        h.assert_held();
    }

    #[test]
    fn try_acquire_fails_under_contention() {
        let h = Handle::new(7);
        let h2 = Arc::clone(&h);

        let g = h.acquire(false);
        let t = std::thread::spawn(move || h2.try_acquire(false).is_none());
        assert!(t.join().unwrap());
        g.release(false);
        assert!(h.try_acquire(false).is_some());
    }

    #[test]
    fn guard_drop_unlocks_without_touching_count() {
        let h = Handle::new(8);
        {
            let mut g = h.acquire(true);
            g.backlog_cap = 5;
            // dropped, not released: reference stays
        }
        let g = h.acquire(false);
        assert_eq!(g.use_count(), 1);
        assert_eq!(g.backlog_cap, 5);
        g.release(true);
    }

    #[test]
    fn backlog_floor_restores_capacity() {
        let h = Handle::new(9);
        let mut g = h.acquire(false);
        g.backlog_cap = 0;
        let seen = g.with_backlog_floor(1, |g| g.backlog_cap);
        assert_eq!(seen, 1);
        assert_eq!(g.backlog_cap, 0);
        g.release(false);
    }
}
