//! Mutator thread registry and the per-thread GC state: execution state,
//! the per-epoch mark flags, thread-local allocation queues and the root
//! slots scanned during root-set acquisition.

use std::{
    ptr::null_mut,
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, Ordering},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::factory::{ExtraList, FinalizerQueue, NodeList};
use crate::object::{ObjRef, ObjectHeader};

pub(crate) const STATE_RUNNABLE: u8 = 0;
pub(crate) const STATE_NATIVE: u8 = 1;
pub(crate) const STATE_SUSPENDED: u8 = 2;

/// Thread-local allocation bookkeeping. Entries stay invisible to the
/// collector until published into the global factory lists.
pub(crate) struct ThreadLocalAlloc {
    pub(crate) objects: NodeList,
    pub(crate) extras: ExtraList,
    pub(crate) finalizers: FinalizerQueue,
}

impl ThreadLocalAlloc {
    fn new() -> Self {
        Self {
            objects: NodeList::new(),
            extras: ExtraList::new(),
            finalizers: FinalizerQueue::new(),
        }
    }
}

/// Per-mutator record. Owned logically by the mutator; the mark flags are
/// mutated by GC workers via CAS.
pub struct ThreadData {
    id: u64,
    exec_state: AtomicU8,
    root_set_locked: AtomicBool,
    cooperative: AtomicBool,
    published: AtomicBool,
    pub(crate) local: Mutex<ThreadLocalAlloc>,
    roots: Mutex<Vec<Root>>,
}

impl ThreadData {
    fn new(id: u64) -> Self {
        Self {
            id,
            exec_state: AtomicU8::new(STATE_NATIVE),
            root_set_locked: AtomicBool::new(false),
            cooperative: AtomicBool::new(false),
            published: AtomicBool::new(false),
            local: Mutex::new(ThreadLocalAlloc::new()),
            roots: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn exec_state(&self) -> u8 {
        self.exec_state.load(Ordering::Acquire)
    }

    pub(crate) fn set_exec_state(&self, state: u8) {
        self.exec_state.store(state, Ordering::Release);
    }

    /// Exactly one worker per epoch wins this CAS and scans the thread's
    /// root set.
    pub(crate) fn try_lock_root_set(&self) -> bool {
        let locked = self
            .root_set_locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if locked {
            log::trace!(target: "gc", "Root set of thread {} acquired", self.id);
        }
        locked
    }

    pub(crate) fn root_set_locked(&self) -> bool {
        self.root_set_locked.load(Ordering::Acquire)
    }

    pub(crate) fn begin_cooperation(&self) {
        self.cooperative.store(true, Ordering::Release);
    }

    pub(crate) fn cooperative(&self) -> bool {
        self.cooperative.load(Ordering::Relaxed)
    }

    pub(crate) fn set_published(&self) {
        self.published.store(true, Ordering::Release);
    }

    pub(crate) fn published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    /// Epoch begin: reset the mark-phase flags.
    pub(crate) fn clear_mark_flags(&self) {
        self.published.store(false, Ordering::Relaxed);
        self.cooperative.store(false, Ordering::Relaxed);
        self.root_set_locked.store(false, Ordering::Release);
    }

    pub(crate) fn add_root(&self, obj: ObjRef) -> Root {
        let root = Arc::new(RootCell(AtomicPtr::new(obj)));
        self.roots.lock().push(root.clone());
        root
    }

    pub(crate) fn remove_root(&self, root: &Root) {
        self.roots.lock().retain(|r| !Arc::ptr_eq(r, root));
    }

    /// Visits every non-null root slot of this thread.
    pub(crate) fn scan_roots(&self, mut visitor: impl FnMut(ObjRef)) -> usize {
        let roots = self.roots.lock();
        let mut scanned = 0;
        for cell in roots.iter() {
            let obj = cell.get();
            if !obj.is_null() {
                scanned += 1;
                visitor(obj);
            }
        }
        scanned
    }
}

unsafe impl Send for ThreadData {}
unsafe impl Sync for ThreadData {}

/// A rooted slot. The mutator may retarget or clear it; the collector reads
/// it during root-set scanning.
pub struct RootCell(AtomicPtr<ObjectHeader>);

impl RootCell {
    pub fn get(&self) -> ObjRef {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, obj: ObjRef) {
        self.0.store(obj, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(null_mut(), Ordering::Release);
    }
}

pub type Root = Arc<RootCell>;

/// Registry of attached mutator threads plus the global root set.
pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<ThreadData>>>,
    globals: Mutex<Vec<Root>>,
    next_id: AtomicU64,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            globals: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers the calling thread. The new thread starts in native state
    /// and must pass a safepoint before running managed code.
    pub(crate) fn register(&self) -> Arc<ThreadData> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let td = Arc::new(ThreadData::new(id));
        self.threads.lock().push(td.clone());
        log::debug!(target: "gc", "Thread {} attached", id);
        td
    }

    pub(crate) fn unregister(&self, td: &ThreadData) {
        self.threads.lock().retain(|t| t.id != td.id);
        log::debug!(target: "gc", "Thread {} detached", td.id);
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<ThreadData>> {
        self.threads.lock().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub(crate) fn add_global_root(&self, obj: ObjRef) -> Root {
        let root = Arc::new(RootCell(AtomicPtr::new(obj)));
        self.globals.lock().push(root.clone());
        root
    }

    pub(crate) fn scan_global_roots(&self, mut visitor: impl FnMut(ObjRef)) -> usize {
        let globals = self.globals.lock();
        let mut scanned = 0;
        for cell in globals.iter() {
            let obj = cell.get();
            if !obj.is_null() {
                scanned += 1;
                visitor(obj);
            }
        }
        scanned
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_set_claim_is_exclusive() {
        let registry = ThreadRegistry::new();
        let td = registry.register();
        td.clear_mark_flags();
        assert!(td.try_lock_root_set());
        assert!(!td.try_lock_root_set());
        td.clear_mark_flags();
        assert!(td.try_lock_root_set());
        registry.unregister(&td);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_root_scanning_skips_cleared_slots() {
        let registry = ThreadRegistry::new();
        let td = registry.register();
        let obj = crate::object::new_permanent(&LEAF, None);
        let kept = td.add_root(obj);
        let dropped = td.add_root(obj);
        dropped.clear();

        let mut seen = 0;
        let scanned = td.scan_roots(|o| {
            assert_eq!(o, obj);
            seen += 1;
        });
        assert_eq!(scanned, 1);
        assert_eq!(seen, 1);

        td.remove_root(&kept);
        assert_eq!(td.scan_roots(|_| {}), 0);
    }

    static LEAF: crate::object::TypeInfo = crate::object::TypeInfo::object("leaf", 0);
}
