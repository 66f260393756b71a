//! Sweep passes. Extra-object records are swept first: the object pass
//! deallocates their base objects and must not race with extra iteration.
//! Both passes run under the factory iteration locks held by the caller.

use std::ptr::null_mut;

use crate::alloc::HeapAccounting;
use crate::factory::{free_node, ExtraList, FinalizerQueue, NodeList};
use crate::gc::statistics::GcHandle;
use crate::object::{ExtraObjectData, EXTRA_FLAG_FINALIZED, EXTRA_FLAG_SWEEPABLE};

/// Removes extra-object records with no surviving owner: records retired by
/// the finalizer pipeline (`FINALIZED`), records detached by the mutator
/// (`SWEEPABLE`), and records whose base object is an unmarked heap object
/// with no pending finalizer. A non-heap base keeps its record alive.
///
/// # Safety
/// Must run before the object pass of the same epoch, under the factory
/// iteration locks.
pub(crate) unsafe fn sweep_extra_objects(handle: &GcHandle, extras: &mut ExtraList) {
    let mut swept = 0;
    let mut prev: *mut ExtraObjectData = null_mut();
    let mut current = extras.head;

    while !current.is_null() {
        let extra = &*current;

        // Finalized records are garbage regardless of their base pointer;
        // the base object is already gone.
        if extra.has_flag(EXTRA_FLAG_FINALIZED) {
            let dead = current;
            current = extras.unlink(prev, current);
            drop(Box::from_raw(dead));
            swept += 1;
            continue;
        }

        if extra.has_flag(EXTRA_FLAG_SWEEPABLE) {
            let base = extra.base_object();
            if !base.is_null() {
                (*base).clear_extra();
            }
            let dead = current;
            current = extras.unlink(prev, current);
            drop(Box::from_raw(dead));
            swept += 1;
            continue;
        }

        let base = extra.base_object();
        let base_alive = !(*base).heap() || crate::factory::mark_word(base).marked();
        if !base_alive {
            if extra.finalizer().is_none() {
                (*base).clear_extra();
                let dead = current;
                current = extras.unlink(prev, current);
                drop(Box::from_raw(dead));
                swept += 1;
            } else {
                // Rides its base into the finalizer queue. Unlinked here so
                // no later extra pass can touch the record while the
                // pipeline frees the base; the pipeline owns it now.
                current = extras.unlink(prev, current);
            }
            continue;
        }

        prev = current;
        current = extra.next;
    }

    handle.add_extras_swept(swept);
}

/// Reclaims unmarked objects. Survivors have their mark reset for the next
/// epoch; unreachable objects with a pending finalizer move into the
/// returned queue, everything else is freed immediately.
///
/// # Safety
/// Must run under the factory iteration locks, after `sweep_extra_objects`.
pub(crate) unsafe fn sweep_objects(
    handle: &GcHandle,
    objects: &mut NodeList,
    accounting: &HeapAccounting,
) -> FinalizerQueue {
    let mut queue = FinalizerQueue::new();
    let mut swept = 0;

    let mut prev = null_mut();
    let mut current = objects.head;
    while !current.is_null() {
        let node = &mut *current;
        if node.mark.try_reset_mark() {
            prev = current;
            current = node.next;
            continue;
        }

        // Unreachable. The extra record, if any, survived the extra pass
        // only when it carries an un-run finalizer.
        let dead = current;
        current = objects.unlink(prev, current);
        let obj = &mut node.header as *mut _;
        let extra = node.header.extra();
        if !extra.is_null()
            && (*extra).finalizer().is_some()
            && !(*extra).has_flag(EXTRA_FLAG_FINALIZED)
        {
            queue.push(obj);
        } else {
            debug_assert!(extra.is_null(), "extra record must not outlive its base");
            accounting.release(node.size);
            free_node(dead);
        }
        swept += 1;
    }

    handle.add_swept(swept);
    log::debug!(
        target: "gc",
        "Epoch #{}: swept {} objects, {} queued for finalization",
        handle.epoch(),
        swept,
        queue.len()
    );
    queue
}
