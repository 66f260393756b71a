//! Scheduler seam. The policy decides nothing here beyond observing epoch
//! boundaries; triggering is manual (`schedule`) or driven by allocation
//! failure through `schedule_and_wait_finished`.

use std::sync::Arc;

use crate::formatted_size;
use crate::gc::state::GcState;

/// Policy callbacks invoked around every collection.
pub trait SchedulerPolicy: Send + Sync {
    fn on_gc_start(&self) {}
    fn on_gc_finish(&self, _epoch: i64, _live_bytes: usize) {}
}

/// Default policy: only logs.
pub struct LoggingSchedulerPolicy;

impl SchedulerPolicy for LoggingSchedulerPolicy {
    fn on_gc_start(&self) {
        log::trace!(target: "gc", "Scheduler notified of GC start");
    }

    fn on_gc_finish(&self, epoch: i64, live_bytes: usize) {
        log::debug!(
            target: "gc",
            "Epoch #{} finished with {} live",
            epoch,
            formatted_size(live_bytes)
        );
    }
}

pub struct GcScheduler {
    policy: Arc<dyn SchedulerPolicy>,
    state: Arc<GcState>,
}

impl GcScheduler {
    pub fn new(policy: Arc<dyn SchedulerPolicy>, state: Arc<GcState>) -> Self {
        Self { policy, state }
    }

    pub fn on_gc_start(&self) {
        self.policy.on_gc_start();
    }

    pub fn on_gc_finish(&self, epoch: i64, live_bytes: usize) {
        self.policy.on_gc_finish(epoch, live_bytes);
    }

    /// Schedules an epoch and blocks the caller until it finishes. The only
    /// mutator-initiated synchronous wait on GC progression; the calling
    /// thread must be in native state.
    pub fn schedule_and_wait_finished(&self) {
        let epoch = self.state.schedule();
        self.state.wait_epoch_finished(epoch);
    }
}
