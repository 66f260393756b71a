//! Allocator seam. The collector consumes this interface; two
//! implementations ship: the per-thread-queue object factory and a pooled
//! heap performing one combined sweep. Both keep fresh allocations in
//! thread-local queues that stay invisible to sweep until published.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::{Mutex, MutexGuard};

use crate::factory::{
    alloc_node, free_node, node_of, node_size, ExtraList, FinalizerQueue, NodeList,
};
use crate::gc::mutator::{ThreadData, ThreadRegistry};
use crate::gc::statistics::GcHandle;
use crate::gc::sweep;
use crate::object::{ExtraObjectData, ObjRef, TypeInfo, EXTRA_FLAG_SWEEPABLE};

/// Heap usage counter with the limit consulted by the OOM machinery.
pub struct HeapAccounting {
    allocated: AtomicUsize,
    limit: AtomicUsize,
}

impl HeapAccounting {
    pub fn new(limit: usize) -> Self {
        Self {
            allocated: AtomicUsize::new(0),
            limit: AtomicUsize::new(limit),
        }
    }

    /// Reserves `size` bytes against the limit; allocation fails (and the
    /// caller schedules a synchronous GC) when the limit would be exceeded.
    pub fn try_reserve(&self, size: usize) -> bool {
        let prev = self.allocated.fetch_add(size, Ordering::AcqRel);
        if prev + size > self.limit.load(Ordering::Acquire) {
            self.allocated.fetch_sub(size, Ordering::AcqRel);
            return false;
        }
        true
    }

    pub(crate) fn reserve(&self, size: usize) {
        self.allocated.fetch_add(size, Ordering::AcqRel);
    }

    pub fn release(&self, size: usize) {
        self.allocated.fetch_sub(size, Ordering::AcqRel);
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Release);
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }
}

/// Holds the factory iteration locks across the sweep; no mutator can
/// publish into the swept lists while a session is open.
pub trait SweepSession {
    /// Post-mark heap correctness scan (runtime-asserts mode).
    fn verify_marks(&mut self);

    /// Runs the extra-object pass, then the object pass, returning the
    /// epoch's finalizer queue.
    fn sweep(&mut self, handle: &GcHandle, registry: &ThreadRegistry) -> FinalizerQueue;
}

pub trait Allocator: Send + Sync {
    fn accounting(&self) -> &HeapAccounting;

    fn create_object(&self, td: &ThreadData, type_info: &'static TypeInfo) -> Option<ObjRef>;

    fn create_array(
        &self,
        td: &ThreadData,
        type_info: &'static TypeInfo,
        len: usize,
    ) -> Option<ObjRef>;

    /// Creates and attaches an extra-object record. Exactly one record per
    /// object: a racing loser is destroyed and the winner returned.
    fn create_extra_object(
        &self,
        td: &ThreadData,
        obj: ObjRef,
        type_info: &'static TypeInfo,
    ) -> *mut ExtraObjectData;

    /// Detaches a record the mutator no longer wants; reclaimed by the next
    /// extra-object sweep.
    fn destroy_unattached_extra(&self, extra: *mut ExtraObjectData) {
        unsafe {
            let base = (*extra).base_object();
            if !base.is_null() {
                (*base).clear_extra();
            }
            (*extra).set_flag(EXTRA_FLAG_SWEEPABLE);
        }
    }

    /// Flushes the thread-local allocation queues into the global state.
    fn publish_thread_local(&self, td: &ThreadData);

    /// Drains the thread's allocator-local finalizer queue.
    fn extract_finalizer_queue(&self, td: &ThreadData) -> FinalizerQueue {
        std::mem::take(&mut td.local.lock().finalizers)
    }

    fn allocated_bytes(&self) -> usize {
        self.accounting().allocated()
    }

    /// Takes the iteration locks. Acquired by the orchestrator before
    /// mutators resume so a terminating thread cannot publish mid-sweep.
    fn begin_sweep(&self) -> Box<dyn SweepSession + '_>;

    /// Non-moving pool trimming hook; runs on the main GC thread after
    /// sweep.
    fn compact_pool(&self) {}

    /// Releases one reclaimed object; used by the finalizer pipeline after
    /// the finalizer ran.
    fn free_reclaimed(&self, obj: ObjRef) {
        unsafe {
            let node = node_of(obj);
            self.accounting().release((*node).size);
            free_node(node);
        }
    }

    /// Frees every allocation, local and global. Test teardown only.
    fn clear_all(&self, registry: &ThreadRegistry);
}

fn create_node(
    accounting: &HeapAccounting,
    type_info: &'static TypeInfo,
    array_len: Option<usize>,
) -> Option<*mut crate::factory::ObjectNode> {
    let size = node_size(type_info, array_len);
    if !accounting.try_reserve(size) {
        return None;
    }
    Some(alloc_node(type_info, array_len))
}

fn attach_extra(
    td: &ThreadData,
    obj: ObjRef,
    type_info: &'static TypeInfo,
) -> (*mut ExtraObjectData, bool) {
    let extra = Box::into_raw(Box::new(ExtraObjectData::new(obj, type_info.finalizer)));
    unsafe {
        if (*obj).try_install_extra(extra) {
            td.local.lock().extras.push(extra);
            (extra, true)
        } else {
            drop(Box::from_raw(extra));
            ((*obj).extra(), false)
        }
    }
}

unsafe fn drain_node_list(list: &mut NodeList, accounting: &HeapAccounting) {
    while let Some(node) = list.pop() {
        accounting.release((*node).size);
        free_node(node);
    }
}

unsafe fn drain_extra_list(list: &mut ExtraList) {
    let mut current = list.head;
    while !current.is_null() {
        let next = (*current).next;
        drop(Box::from_raw(current));
        current = next;
    }
    *list = ExtraList::new();
}

/// Object factory with per-thread queues; separate iteration locks for the
/// object and extra-object lists.
pub struct ObjectFactoryAllocator {
    objects: Mutex<NodeList>,
    extras: Mutex<ExtraList>,
    accounting: HeapAccounting,
}

impl ObjectFactoryAllocator {
    pub fn new(accounting: HeapAccounting) -> Self {
        Self {
            objects: Mutex::new(NodeList::new()),
            extras: Mutex::new(ExtraList::new()),
            accounting,
        }
    }
}

impl Allocator for ObjectFactoryAllocator {
    fn accounting(&self) -> &HeapAccounting {
        &self.accounting
    }

    fn create_object(&self, td: &ThreadData, type_info: &'static TypeInfo) -> Option<ObjRef> {
        let node = create_node(&self.accounting, type_info, None)?;
        td.local.lock().objects.push(node);
        Some(unsafe { &mut (*node).header })
    }

    fn create_array(
        &self,
        td: &ThreadData,
        type_info: &'static TypeInfo,
        len: usize,
    ) -> Option<ObjRef> {
        let node = create_node(&self.accounting, type_info, Some(len))?;
        td.local.lock().objects.push(node);
        Some(unsafe { &mut (*node).header })
    }

    fn create_extra_object(
        &self,
        td: &ThreadData,
        obj: ObjRef,
        type_info: &'static TypeInfo,
    ) -> *mut ExtraObjectData {
        attach_extra(td, obj, type_info).0
    }

    fn publish_thread_local(&self, td: &ThreadData) {
        let mut local = td.local.lock();
        self.objects.lock().splice(&mut local.objects);
        self.extras.lock().splice(&mut local.extras);
    }

    fn begin_sweep(&self) -> Box<dyn SweepSession + '_> {
        Box::new(FactorySweepSession {
            extras: Some(self.extras.lock()),
            objects: Some(self.objects.lock()),
            accounting: &self.accounting,
        })
    }

    fn clear_all(&self, registry: &ThreadRegistry) {
        unsafe {
            for td in registry.snapshot() {
                let mut local = td.local.lock();
                drain_node_list(&mut local.objects, &self.accounting);
                drain_extra_list(&mut local.extras);
            }
            drain_node_list(&mut self.objects.lock(), &self.accounting);
            drain_extra_list(&mut self.extras.lock());
        }
    }
}

struct FactorySweepSession<'a> {
    extras: Option<MutexGuard<'a, ExtraList>>,
    objects: Option<MutexGuard<'a, NodeList>>,
    accounting: &'a HeapAccounting,
}

impl<'a> FactorySweepSession<'a> {
    fn marked_objects(&self) -> Vec<ObjRef> {
        let objects = self.objects.as_ref().expect("object lock released");
        let mut result = Vec::new();
        let mut current = objects.head;
        unsafe {
            while !current.is_null() {
                result.push(std::ptr::addr_of_mut!((*current).header));
                current = (*current).next;
            }
        }
        result
    }
}

impl<'a> SweepSession for FactorySweepSession<'a> {
    fn verify_marks(&mut self) {
        crate::gc::mark::check_mark_correctness(self.marked_objects().into_iter());
    }

    fn sweep(&mut self, handle: &GcHandle, registry: &ThreadRegistry) -> FinalizerQueue {
        debug_assert!(
            registry.snapshot().iter().all(|td| td.published()),
            "sweep started with unpublished thread queues"
        );
        // extra-object pass first: the object pass deallocates bases
        {
            let extras = self.extras.as_mut().expect("extra lock released");
            unsafe { sweep::sweep_extra_objects(handle, &mut **extras) };
        }
        self.extras = None;

        let queue = {
            let objects = self.objects.as_mut().expect("object lock released");
            unsafe { sweep::sweep_objects(handle, &mut **objects, self.accounting) }
        };
        self.objects = None;
        queue
    }
}

/// Custom-heap allocator: one pool, one iteration lock, one combined sweep
/// that also drains the per-thread finalizer queues.
pub struct PooledHeapAllocator {
    pool: Mutex<HeapPool>,
    accounting: HeapAccounting,
}

struct HeapPool {
    objects: NodeList,
    extras: ExtraList,
    finalizers: FinalizerQueue,
}

impl PooledHeapAllocator {
    pub fn new(accounting: HeapAccounting) -> Self {
        Self {
            pool: Mutex::new(HeapPool {
                objects: NodeList::new(),
                extras: ExtraList::new(),
                finalizers: FinalizerQueue::new(),
            }),
            accounting,
        }
    }
}

impl Allocator for PooledHeapAllocator {
    fn accounting(&self) -> &HeapAccounting {
        &self.accounting
    }

    fn create_object(&self, td: &ThreadData, type_info: &'static TypeInfo) -> Option<ObjRef> {
        let node = create_node(&self.accounting, type_info, None)?;
        td.local.lock().objects.push(node);
        Some(unsafe { &mut (*node).header })
    }

    fn create_array(
        &self,
        td: &ThreadData,
        type_info: &'static TypeInfo,
        len: usize,
    ) -> Option<ObjRef> {
        let node = create_node(&self.accounting, type_info, Some(len))?;
        td.local.lock().objects.push(node);
        Some(unsafe { &mut (*node).header })
    }

    fn create_extra_object(
        &self,
        td: &ThreadData,
        obj: ObjRef,
        type_info: &'static TypeInfo,
    ) -> *mut ExtraObjectData {
        attach_extra(td, obj, type_info).0
    }

    fn publish_thread_local(&self, td: &ThreadData) {
        let mut local = td.local.lock();
        let mut pool = self.pool.lock();
        pool.objects.splice(&mut local.objects);
        pool.extras.splice(&mut local.extras);
    }

    fn begin_sweep(&self) -> Box<dyn SweepSession + '_> {
        Box::new(PooledSweepSession {
            pool: Some(self.pool.lock()),
            accounting: &self.accounting,
        })
    }

    fn clear_all(&self, registry: &ThreadRegistry) {
        unsafe {
            for td in registry.snapshot() {
                let mut local = td.local.lock();
                drain_node_list(&mut local.objects, &self.accounting);
                drain_extra_list(&mut local.extras);
            }
            let mut pool = self.pool.lock();
            let HeapPool {
                ref mut objects,
                ref mut extras,
                ..
            } = *pool;
            drain_node_list(objects, &self.accounting);
            drain_extra_list(extras);
        }
    }
}

struct PooledSweepSession<'a> {
    pool: Option<MutexGuard<'a, HeapPool>>,
    accounting: &'a HeapAccounting,
}

impl<'a> SweepSession for PooledSweepSession<'a> {
    fn verify_marks(&mut self) {
        let pool = self.pool.as_ref().expect("pool lock released");
        let mut objects = Vec::new();
        let mut current = pool.objects.head;
        unsafe {
            while !current.is_null() {
                objects.push(std::ptr::addr_of_mut!((*current).header));
                current = (*current).next;
            }
        }
        crate::gc::mark::check_mark_correctness(objects.into_iter());
    }

    fn sweep(&mut self, handle: &GcHandle, registry: &ThreadRegistry) -> FinalizerQueue {
        let mut queue = {
            let pool = self.pool.as_mut().expect("pool lock released");
            let HeapPool {
                ref mut objects,
                ref mut extras,
                ref mut finalizers,
            } = **pool;
            unsafe {
                sweep::sweep_extra_objects(handle, extras);
                let mut queue = sweep::sweep_objects(handle, objects, self.accounting);
                queue.transfer_all_from(finalizers);
                queue
            }
        };
        self.pool = None;

        // drain the allocator-local finalizer queues of every thread
        for td in registry.snapshot() {
            let mut local = std::mem::take(&mut td.local.lock().finalizers);
            queue.transfer_all_from(&mut local);
        }
        queue
    }
}

/// Compile-time allocator selection surfaced as configuration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocatorKind {
    ObjectFactory,
    PooledHeap,
}

impl AllocatorKind {
    pub fn build(self, accounting: HeapAccounting) -> Arc<dyn Allocator> {
        match self {
            AllocatorKind::ObjectFactory => Arc::new(ObjectFactoryAllocator::new(accounting)),
            AllocatorKind::PooledHeap => Arc::new(PooledHeapAllocator::new(accounting)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::mark_word;
    use crate::gc::statistics::GcStatistics;

    static LEAF: TypeInfo = TypeInfo::object("leaf", 0);
    static REFS: TypeInfo = TypeInfo::array("refs");

    #[test]
    fn test_limit_fails_allocation() {
        let registry = ThreadRegistry::new();
        let td = registry.register();
        let allocator = ObjectFactoryAllocator::new(HeapAccounting::new(
            node_size(&LEAF, None) * 2,
        ));

        assert!(allocator.create_object(&td, &LEAF).is_some());
        assert!(allocator.create_object(&td, &LEAF).is_some());
        assert!(allocator.create_object(&td, &LEAF).is_none());
        allocator.clear_all(&registry);
        assert_eq!(allocator.allocated_bytes(), 0);
    }

    #[test]
    fn test_publish_makes_allocations_sweepable() {
        let registry = ThreadRegistry::new();
        let td = registry.register();
        let stats = GcStatistics::new();
        let handle = stats.create(1);
        let allocator = ObjectFactoryAllocator::new(HeapAccounting::new(usize::MAX));

        let survivor = allocator.create_object(&td, &LEAF).unwrap();
        let garbage = allocator.create_array(&td, &REFS, 4).unwrap();
        let unpublished = {
            // stays local, invisible to this sweep
            allocator.publish_thread_local(&td);
            td.set_published();
            allocator.create_object(&td, &LEAF).unwrap()
        };
        unsafe {
            mark_word(survivor).try_mark();
        }
        let _ = garbage;

        let mut session = allocator.begin_sweep();
        let queue = session.sweep(&handle, &registry);
        drop(session);
        assert!(queue.is_empty());
        assert_eq!(handle.swept(), 1);

        let expected = node_size(&LEAF, None) * 2;
        assert_eq!(allocator.allocated_bytes(), expected);
        let _ = unpublished;
        allocator.clear_all(&registry);
    }

    #[test]
    fn test_extra_records_attach_once() {
        let registry = ThreadRegistry::new();
        let td = registry.register();
        let allocator = PooledHeapAllocator::new(HeapAccounting::new(usize::MAX));

        let obj = allocator.create_object(&td, &LEAF).unwrap();
        let first = allocator.create_extra_object(&td, obj, &LEAF);
        let second = allocator.create_extra_object(&td, obj, &LEAF);
        assert_eq!(first, second);
        unsafe {
            assert_eq!((*obj).extra(), first);
        }
        allocator.clear_all(&registry);
    }
}
