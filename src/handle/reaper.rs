//! Idle resource reaper.
//!
//! A periodic sweep, independent of any request path, that frees handles
//! whose teardown was requested and whose last reference has dropped. The
//! sweep never blocks on a contended handle: entries it cannot lock are
//! simply skipped until the next tick, keeping the walk bounded.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, tick, Sender};
use crossbeam::select;
use tracing::debug;

use super::table::HandleTable;
use super::HandleState;
use crate::config::MIN_REAPER_INTERVAL_MS;
use crate::descriptor::DescriptorTable;

/// One sweep over the handle table. Returns the number of handles freed.
///
/// An entry is freed only when all of these hold under its own lock:
/// teardown was requested, the control block is fully quiesced
/// ([`HandleState::Dead`]), and the use-count is zero. Freeing unlinks the
/// entry from the table, detaches it from its descriptor slot, and drops
/// the control block; the handle memory itself goes when the last
/// reference does. An entry is freed at most once: once unlinked, no later
/// sweep can see it.
pub fn sweep(table: &HandleTable, descriptors: &DescriptorTable) -> usize {
    let mut visited = 0usize;
    let mut freed = 0usize;
    let mut entries = table.entries().write();
    entries.retain(|handle| {
        visited += 1;
        if !handle.teardown_requested() {
            return true;
        }
        // non-blocking: a contended handle waits for the next tick
        let Some(guard) = handle.try_acquire(false) else {
            return true;
        };
        if guard.use_count() != 0 || guard.state != HandleState::Dead {
            guard.release(false);
            return true;
        }
        let cb = handle.detach_control_block(guard);
        if let Some(slot) = cb.descriptor {
            descriptors.detach(slot, handle);
        }
        table.note_removed();
        freed += 1;
        false
    });
    drop(entries);
    if visited > 0 {
        debug!(visited, freed, "reaper sweep");
    }
    freed
}

/// Handle to the running sweep thread.
pub struct Reaper {
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Start sweeping every `interval`, clamped to the configured floor.
    pub fn start(
        table: Arc<HandleTable>,
        descriptors: Arc<DescriptorTable>,
        interval: Duration,
    ) -> Reaper {
        let interval = interval.max(Duration::from_millis(MIN_REAPER_INTERVAL_MS));
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread = std::thread::Builder::new()
            .name("sctp-reaper".into())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            sweep(&table, &descriptors);
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
            })
            .expect("spawn reaper thread");
        Reaper {
            stop: stop_tx,
            thread: Some(thread),
        }
    }

    /// Stop the sweep thread and wait for it. Idempotent.
    pub fn stop(&mut self) {
        let _ = self.stop.send(());
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> (Arc<HandleTable>, Arc<DescriptorTable>) {
        (HandleTable::new(), Arc::new(DescriptorTable::new(4)))
    }

    #[test]
    fn sweep_frees_dead_unreferenced_handles() {
        let (table, descriptors) = tables();
        let h = table.create();
        h.set_dead();

        assert_eq!(sweep(&table, &descriptors), 1);
        assert!(!table.contains(&h));
        assert_eq!(table.live_count(), 0);

        // freed exactly once: nothing left for a second sweep
        assert_eq!(sweep(&table, &descriptors), 0);
    }

    #[test]
    fn sweep_ignores_active_handles() {
        let (table, descriptors) = tables();
        let h = table.create();
        assert_eq!(sweep(&table, &descriptors), 0);
        assert!(table.contains(&h));
    }

    #[test]
    fn sweep_skips_referenced_handles() {
        let (table, descriptors) = tables();
        let h = table.create();
        {
            let g = h.acquire(true);
            g.release(false); // keep the reference
        }
        h.set_dead();
        assert_eq!(sweep(&table, &descriptors), 0);
        assert!(table.contains(&h));

        let g = h.acquire(false);
        g.release(true);
        assert_eq!(sweep(&table, &descriptors), 1);
    }

    #[test]
    fn sweep_skips_not_yet_quiesced_handles() {
        let (table, descriptors) = tables();
        let h = table.create();
        h.mark_for_teardown();
        assert_eq!(sweep(&table, &descriptors), 0);
        h.set_dead();
        assert_eq!(sweep(&table, &descriptors), 1);
    }

    #[test]
    fn sweep_skips_contended_handles() {
        let (table, descriptors) = tables();
        let h = table.create();
        h.set_dead();

        let g = h.acquire(false);
        assert_eq!(sweep(&table, &descriptors), 0, "locked entry must be skipped");
        g.release(false);
        assert_eq!(sweep(&table, &descriptors), 1);
    }

    #[test]
    fn sweep_detaches_descriptor_slot() {
        let (table, descriptors) = tables();
        let h = table.create();
        let slot = descriptors.reserve().unwrap();
        descriptors.publish(slot, h.clone());
        {
            let mut g = h.acquire(false);
            g.descriptor = Some(slot);
            g.release(false);
        }
        h.set_dead();

        assert_eq!(sweep(&table, &descriptors), 1);
        assert!(descriptors.get(slot).is_none());
    }

    #[test]
    fn reaper_thread_sweeps_on_its_own() {
        let (table, descriptors) = tables();
        let h = table.create();
        h.set_dead();

        let mut reaper = Reaper::start(
            table.clone(),
            descriptors.clone(),
            Duration::from_millis(1),
        );
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while table.contains(&h) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        reaper.stop();
        assert!(!table.contains(&h));
    }
}
