//! Mark algorithm: root-set acquisition and object graph traversal. The
//! serial entry points here drive the STMS collector and the
//! single-threaded-mark configuration; the parallel dispatcher reuses the
//! same per-object processing.

use std::sync::Arc;

use crate::alloc::Allocator;
use crate::factory::mark_word;
use crate::gc::mutator::{ThreadData, ThreadRegistry};
use crate::gc::statistics::GcHandle;
use crate::object::ObjRef;

/// Marks `obj` if it is an unmarked heap object; newly gray objects are
/// handed to `push`. Permanent objects are never enqueued.
#[inline]
pub(crate) fn try_mark(obj: ObjRef, push: &mut impl FnMut(ObjRef)) -> bool {
    unsafe {
        if !(*obj).heap() {
            return false;
        }
        if mark_word(obj).try_mark() {
            push(obj);
            return true;
        }
    }
    false
}

/// Processes one gray object: walks its reference fields (element slots for
/// arrays) and grays every unmarked heap target. Extra-object data is part
/// of its base object and is never enqueued on its own. Returns the number
/// of objects newly marked.
pub(crate) fn process_gray(obj: ObjRef, push: &mut impl FnMut(ObjRef)) -> usize {
    let mut marked = 0;
    unsafe {
        (*obj).each_ref_field(|field| {
            if try_mark(field, push) {
                marked += 1;
            }
        });
    }
    marked
}

/// Claims and scans the root set of one mutator: publishes its thread-local
/// allocation queues first so the allocator view is globally visible, then
/// pushes its rooted objects.
pub(crate) fn scan_thread_root_set(
    td: &ThreadData,
    allocator: &dyn Allocator,
    handle: &GcHandle,
    push: &mut impl FnMut(ObjRef),
) -> usize {
    allocator.publish_thread_local(td);
    td.set_published();
    let mut marked = 0;
    let scanned = td.scan_roots(|obj| {
        if try_mark(obj, push) {
            marked += 1;
        }
    });
    handle.root_set_claimed();
    handle.add_roots_scanned(scanned);
    marked
}

pub(crate) fn scan_global_root_set(
    registry: &ThreadRegistry,
    handle: &GcHandle,
    push: &mut impl FnMut(ObjRef),
) -> usize {
    let mut marked = 0;
    let scanned = registry.scan_global_roots(|obj| {
        if try_mark(obj, push) {
            marked += 1;
        }
    });
    handle.add_roots_scanned(scanned);
    marked
}

/// Serial root collection: the calling thread claims every mutator's root
/// set. Runs inside the pause, so every claim must succeed.
pub(crate) fn collect_root_set(
    handle: &GcHandle,
    registry: &ThreadRegistry,
    allocator: &Arc<dyn Allocator>,
    queue: &mut Vec<ObjRef>,
) {
    let mut marked = 0;
    for td in registry.snapshot() {
        td.clear_mark_flags();
        let claimed = td.try_lock_root_set();
        assert!(claimed, "root set contended during serial mark");
        marked += scan_thread_root_set(&td, allocator.as_ref(), handle, &mut |o| queue.push(o));
    }
    marked += scan_global_root_set(registry, handle, &mut |o| queue.push(o));
    handle.add_marked(marked);
    log::debug!(
        target: "gc",
        "Epoch #{}: collected root set of {} objects",
        handle.epoch(),
        queue.len()
    );
}

/// Serial mark loop: drains the gray worklist on the calling thread.
pub(crate) fn mark_serial(handle: &GcHandle, queue: &mut Vec<ObjRef>) {
    let mut marked = 0;
    while let Some(obj) = queue.pop() {
        marked += process_gray(obj, &mut |o| queue.push(o));
    }
    handle.add_marked(marked);
}

/// Post-mark correctness scan, enabled by `runtime_asserts`: every reference
/// field of a marked object must target a marked heap object or a non-heap
/// object.
pub(crate) fn check_mark_correctness(objects: impl Iterator<Item = ObjRef>) {
    for obj in objects {
        unsafe {
            if !mark_word(obj).marked() {
                continue;
            }
            (*obj).each_ref_field(|field| {
                assert!(
                    crate::factory::is_marked(field),
                    "field {:p} of an alive object {:p} must be alive",
                    field,
                    obj
                );
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{alloc_node, free_node, node_of};
    use crate::object::{set_reference, TypeInfo};

    static PAIR: TypeInfo = TypeInfo::object("pair", 2);

    fn heap_obj() -> ObjRef {
        unsafe { &mut (*alloc_node(&PAIR, None)).header }
    }

    #[test]
    fn test_mark_reaches_cycles() {
        unsafe {
            let a = heap_obj();
            let b = heap_obj();
            let c = heap_obj();
            set_reference(a, 0, b);
            set_reference(b, 0, a);
            set_reference(b, 1, c);

            let mut queue = Vec::new();
            assert!(try_mark(a, &mut |o| queue.push(o)));
            let mut marked = 1;
            while let Some(obj) = queue.pop() {
                marked += process_gray(obj, &mut |o| queue.push(o));
            }
            assert_eq!(marked, 3);
            for obj in [a, b, c] {
                assert!(mark_word(obj).marked());
                free_node(node_of(obj));
            }
        }
    }

    #[test]
    fn test_permanent_targets_are_not_enqueued() {
        unsafe {
            let a = heap_obj();
            let perm = crate::object::new_permanent(&PAIR, None);
            set_reference(a, 0, perm);

            let mut queue = Vec::new();
            try_mark(a, &mut |o| queue.push(o));
            assert_eq!(queue.len(), 1);
            queue.clear();
            process_gray(a, &mut |o| queue.push(o));
            assert!(queue.is_empty());
            free_node(node_of(a));
        }
    }
}
