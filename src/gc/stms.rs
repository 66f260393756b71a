//! Same-thread stop-the-world mark-and-sweep: the main GC thread collects
//! roots and marks serially inside the single pause; sweep also completes
//! before mutators resume.

use crate::gc::mark;
use crate::gc::statistics::GcHandle;
use crate::gc::{CollectorVariant, GcShared};

pub(crate) struct SameThreadMarkSweep;

impl CollectorVariant for SameThreadMarkSweep {
    fn begin_epoch(&self, _gc: &GcShared, _handle: &GcHandle) {}

    fn wait_mutators_paused(&self, gc: &GcShared) {
        gc.suspension.wait_for_suspension();
    }

    fn run_mark(&self, gc: &GcShared, handle: &GcHandle) {
        let mut queue = Vec::new();
        mark::collect_root_set(handle, &gc.registry, &gc.allocator, &mut queue);
        mark::mark_serial(handle, &mut queue);
    }

    fn concurrent_weak_sweep(&self) -> bool {
        false
    }

    fn concurrent_sweep(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "same-thread mark & sweep"
    }
}
