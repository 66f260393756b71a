//! Epoch state machine. Every collection cycle is a numbered epoch moving
//! through `Scheduled → Started → Finished → Finalized`; all cross-thread
//! waits on GC progress go through this type.

use crate::sync::Monitor;

struct StateInner {
    scheduled: i64,
    started: i64,
    finished: i64,
    finalized: i64,
    shutdown: bool,
}

pub struct GcState {
    m: Monitor<StateInner>,
}

impl GcState {
    pub fn new() -> Self {
        Self {
            m: Monitor::new(StateInner {
                scheduled: 0,
                started: 0,
                finished: 0,
                finalized: 0,
                shutdown: false,
            }),
        }
    }

    /// Assigns the next epoch and wakes the main GC thread. If an epoch is
    /// already scheduled but not yet started, returns that pending epoch.
    pub fn schedule(&self) -> i64 {
        let mut g = self.m.lock();
        if g.scheduled <= g.started {
            g.scheduled = g.started + 1;
            log::debug!(target: "gc", "Scheduled epoch #{}", g.scheduled);
        }
        let epoch = g.scheduled;
        g.notify_all();
        epoch
    }

    /// Blocks the main GC thread until an epoch is scheduled or shutdown.
    pub fn wait_scheduled(&self) -> Option<i64> {
        let mut g = self.m.lock();
        loop {
            if g.shutdown {
                return None;
            }
            if g.scheduled > g.started {
                return Some(g.scheduled);
            }
            g.wait();
        }
    }

    pub fn start(&self, epoch: i64) {
        let mut g = self.m.lock();
        assert_eq!(g.started + 1, epoch, "epochs must start in order");
        g.started = epoch;
        g.notify_all();
    }

    pub fn finish(&self, epoch: i64) {
        let mut g = self.m.lock();
        assert_eq!(g.started, epoch, "cannot finish an epoch that has not started");
        assert!(g.finished < epoch);
        g.finished = epoch;
        g.notify_all();
    }

    pub fn finalized(&self, epoch: i64) {
        let mut g = self.m.lock();
        assert!(g.finished >= epoch, "finalized implies finished");
        assert!(g.finalized < epoch);
        g.finalized = epoch;
        g.notify_all();
    }

    pub fn wait_epoch_finished(&self, epoch: i64) {
        let mut g = self.m.lock();
        while g.finished < epoch && !g.shutdown {
            g.wait();
        }
    }

    pub fn wait_epoch_finalized(&self, epoch: i64) {
        let mut g = self.m.lock();
        while g.finalized < epoch && !g.shutdown {
            g.wait();
        }
    }

    /// Idempotent. Waits out any in-flight or pending epoch (a collection
    /// that has started always runs to completion), then unblocks every
    /// waiter with the terminal value.
    pub fn shutdown(&self) {
        let mut g = self.m.lock();
        while !g.shutdown && (g.started != g.finished || g.scheduled != g.started) {
            g.wait();
        }
        g.shutdown = true;
        g.notify_all();
    }
}

impl Default for GcState {
    fn default() -> Self {
        Self::new()
    }
}
