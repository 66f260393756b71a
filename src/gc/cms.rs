//! Parallel-mark / concurrent-sweep: marking is distributed by the mark
//! dispatcher across the main GC thread, auxiliary threads and cooperating
//! mutators; sweep (and optionally weak processing) overlaps resumed
//! mutator execution.

use crate::gc::statistics::GcHandle;
use crate::gc::{CollectorVariant, GcShared};

pub(crate) struct ParallelMarkConcurrentSweep {
    pub(crate) concurrent_weak_sweep: bool,
}

impl CollectorVariant for ParallelMarkConcurrentSweep {
    fn begin_epoch(&self, gc: &GcShared, handle: &GcHandle) {
        gc.dispatcher.begin_marking_epoch(handle.clone());
    }

    fn wait_mutators_paused(&self, gc: &GcShared) {
        gc.dispatcher.wait_mutators_paused();
    }

    fn run_mark(&self, gc: &GcShared, _handle: &GcHandle) {
        gc.dispatcher.run_main_in_stw();
        gc.dispatcher.end_marking_epoch();
    }

    fn concurrent_weak_sweep(&self) -> bool {
        self.concurrent_weak_sweep
    }

    fn concurrent_sweep(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "parallel mark & concurrent sweep"
    }
}
