//! Suspension coordinator: the single-requester stop-the-world rendezvous.
//! Mutators poll the request flag at safepoints and park on the shared
//! monitor; the main GC thread waits until every registered thread is at a
//! safepoint or in blocking native code.

use std::sync::Arc;

use crate::gc::mutator::{ThreadData, ThreadRegistry, STATE_RUNNABLE, STATE_SUSPENDED};
use crate::sync::{Monitor, SharedFlag};

pub struct SuspensionCoordinator {
    requested: SharedFlag,
    monitor: Monitor<()>,
    registry: Arc<ThreadRegistry>,
}

impl SuspensionCoordinator {
    pub fn new(registry: Arc<ThreadRegistry>) -> Self {
        Self {
            requested: SharedFlag::new(),
            monitor: Monitor::new(()),
            registry,
        }
    }

    /// Arms the global pause. Only one requester is allowed at a time; only
    /// the main GC thread may call this.
    pub fn request_suspension(&self) -> bool {
        let ok = self.requested.try_set();
        if ok {
            log::debug!(target: "gc", "Threads suspension requested");
        }
        ok
    }

    pub fn is_requested(&self) -> bool {
        self.requested.is_set()
    }

    /// Blocks until every registered mutator has stopped mutating: parked at
    /// a safepoint or running native code.
    pub fn wait_for_suspension(&self) {
        self.wait_until(|td| td.exec_state() != STATE_RUNNABLE);
    }

    /// Same rendezvous with a custom pause predicate; the mark dispatcher
    /// counts cooperating mutators as paused.
    pub(crate) fn wait_until(&self, paused: impl Fn(&ThreadData) -> bool) {
        assert!(
            self.requested.is_set(),
            "waiting for suspension that was never requested"
        );
        let mut g = self.monitor.lock();
        loop {
            let all_paused = self.registry.snapshot().iter().all(|td| paused(td));
            if all_paused {
                return;
            }
            g.wait();
        }
    }

    /// Lifts the pause and unblocks parked mutators.
    pub fn resume(&self) {
        let g = self.monitor.lock();
        self.requested.unset();
        g.notify_all();
        log::debug!(target: "gc", "Threads resumed");
    }

    /// Called by a mutator from the safepoint slow path; returns once the
    /// pause is lifted.
    pub(crate) fn park(&self, td: &ThreadData) {
        let mut g = self.monitor.lock();
        while self.requested.is_set() {
            td.set_exec_state(STATE_SUSPENDED);
            g.notify_all();
            g.wait();
        }
        td.set_exec_state(STATE_RUNNABLE);
    }

    /// Wakes the coordinator after a thread changed its execution state
    /// (native transitions, cooperation).
    pub(crate) fn notify_state_change(&self) {
        let g = self.monitor.lock();
        g.notify_all();
    }
}
