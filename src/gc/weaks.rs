//! Weak reference registry and processor. Weak slots never participate in
//! reachability; after marking, slots whose target stayed unmarked are
//! atomically cleared. In the concurrent configuration a read barrier
//! filters unmarked targets while the processor overlaps mutator execution.

use std::{
    ptr::null_mut,
    sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, Ordering},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::factory::is_marked;
use crate::gc::statistics::GcHandle;
use crate::object::{ObjRef, ObjectHeader};

pub(crate) struct WeakBarriers {
    enabled: AtomicBool,
    epoch: AtomicI64,
}

impl WeakBarriers {
    fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            epoch: AtomicI64::new(0),
        }
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

pub(crate) struct WeakSlot {
    target: AtomicPtr<ObjectHeader>,
}

unsafe impl Send for WeakSlot {}
unsafe impl Sync for WeakSlot {}

/// Mutator handle to a weak slot. Reads go through the barrier: while the
/// concurrent weak sweep is running, an unmarked target reads as null.
#[derive(Clone)]
pub struct WeakRef {
    slot: Arc<WeakSlot>,
    barriers: Arc<WeakBarriers>,
}

impl WeakRef {
    /// Current target, or `None` once the target was collected. Never
    /// returns an unmarked heap object while barriers are enabled.
    pub fn get(&self) -> Option<ObjRef> {
        let target = self.slot.target.load(Ordering::Acquire);
        if target.is_null() {
            return None;
        }
        if self.barriers.enabled() && !is_marked(target) {
            return None;
        }
        Some(target)
    }
}

/// Externally-owned collection of weak slots. The collector only needs
/// iteration and CAS-clear.
pub struct WeakRefRegistry {
    slots: Mutex<Vec<Arc<WeakSlot>>>,
    barriers: Arc<WeakBarriers>,
}

impl WeakRefRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            barriers: Arc::new(WeakBarriers::new()),
        }
    }

    pub fn create(&self, target: ObjRef) -> WeakRef {
        let slot = Arc::new(WeakSlot {
            target: AtomicPtr::new(target),
        });
        self.slots.lock().push(slot.clone());
        WeakRef {
            slot,
            barriers: self.barriers.clone(),
        }
    }

    /// Instructs mutator weak reads to consult the mark bit. Called before
    /// threads resume, so reads during the concurrent weak sweep only see
    /// marked targets or null.
    pub(crate) fn enable_barriers(&self, epoch: i64) {
        self.barriers.epoch.store(epoch, Ordering::Release);
        self.barriers.enabled.store(true, Ordering::Release);
        log::debug!(target: "gc", "Weak reference barriers enabled for epoch #{}", epoch);
    }

    /// Torn down during the second pause of the epoch.
    pub(crate) fn disable_barriers(&self) {
        self.barriers.enabled.store(false, Ordering::Release);
        log::debug!(target: "gc", "Weak reference barriers disabled");
    }

    /// Nulls every slot whose target did not survive marking. CAS so a
    /// concurrent reader observes either the previous target or null.
    pub(crate) fn process(&self, handle: &GcHandle) {
        let mut slots = self.slots.lock();
        // drop registry nodes whose every mutator handle is gone
        slots.retain(|slot| Arc::strong_count(slot) > 1);

        let mut cleared = 0;
        for slot in slots.iter() {
            let target = slot.target.load(Ordering::Acquire);
            if target.is_null() {
                continue;
            }
            unsafe {
                if !(*target).heap() {
                    continue;
                }
            }
            if !is_marked(target)
                && slot
                    .target
                    .compare_exchange(target, null_mut(), Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                cleared += 1;
            }
        }
        log::debug!(
            target: "gc",
            "Epoch #{}: {} of {} weak references nulled",
            handle.epoch(),
            cleared,
            slots.len()
        );
    }
}

impl Default for WeakRefRegistry {
    fn default() -> Self {
        Self::new()
    }
}
