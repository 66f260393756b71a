//! Finalizer pipeline: a dedicated on-demand thread consumes per-epoch
//! batches in FIFO order, runs each finalizer, retires the extra-object
//! record and releases the object's memory, then reports the epoch as
//! finalized.
//!
//! Finalizers must not panic: a panic unwinds through and kills the
//! finalizer thread, the epoch is never reported finalized, and a later
//! stop aborts on the join.

use std::{collections::VecDeque, sync::Arc, thread::JoinHandle};

use parking_lot::Mutex;

use crate::alloc::Allocator;
use crate::factory::FinalizerQueue;
use crate::object::{ObjRef, EXTRA_FLAG_FINALIZED};
use crate::sync::Monitor;

struct PipelineState {
    queue: VecDeque<(i64, FinalizerQueue)>,
    running: bool,
    initialized: bool,
    stop_requested: bool,
}

type EpochDoneFn = Arc<dyn Fn(i64) + Send + Sync>;

pub struct FinalizerProcessor {
    state: Monitor<PipelineState>,
    thread: Mutex<Option<JoinHandle<()>>>,
    allocator: Arc<dyn Allocator>,
    epoch_done: EpochDoneFn,
}

impl FinalizerProcessor {
    pub fn new(allocator: Arc<dyn Allocator>, epoch_done: EpochDoneFn) -> Self {
        Self {
            state: Monitor::new(PipelineState {
                queue: VecDeque::new(),
                running: false,
                initialized: false,
                stop_requested: false,
            }),
            thread: Mutex::new(None),
            allocator,
            epoch_done,
        }
    }

    /// Hands a finalizer batch to the pipeline. Non-blocking; completes the
    /// epoch inline when there is nothing to run and no thread to order
    /// behind. The caller must hold no GC-wide locks: this may start the
    /// finalizer thread.
    pub fn schedule_tasks(self: &Arc<Self>, queue: FinalizerQueue, epoch: i64) {
        {
            let mut g = self.state.lock();
            if queue.is_empty() && !g.running && g.queue.is_empty() {
                drop(g);
                (self.epoch_done)(epoch);
                return;
            }
            g.queue.push_back((epoch, queue));
            g.notify_all();
        }
        self.start_thread_if_none();
    }

    pub fn start_thread_if_none(self: &Arc<Self>) {
        let mut g = self.state.lock();
        if g.running {
            return;
        }
        g.running = true;
        g.initialized = false;
        g.stop_requested = false;
        drop(g);

        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name("gc finalizer thread".into())
            .spawn(move || this.thread_body())
            .expect("failed to spawn finalizer thread");
        *self.thread.lock() = Some(handle);
    }

    pub fn wait_thread_initialized(&self) {
        let mut g = self.state.lock();
        while g.running && !g.initialized {
            g.wait();
        }
    }

    /// Drains the queue, then stops and joins the finalizer thread.
    pub fn stop_thread(&self) {
        {
            let mut g = self.state.lock();
            if !g.running {
                return;
            }
            g.stop_requested = true;
            g.notify_all();
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            handle.join().expect("finalizer thread panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    fn thread_body(&self) {
        log::debug!(target: "gc", "Finalizer thread starts execution");
        {
            let mut g = self.state.lock();
            g.initialized = true;
            g.notify_all();
        }
        loop {
            let batch = {
                let mut g = self.state.lock();
                loop {
                    if let Some(batch) = g.queue.pop_front() {
                        break Some(batch);
                    }
                    if g.stop_requested {
                        g.running = false;
                        g.notify_all();
                        break None;
                    }
                    g.wait();
                }
            };
            let Some((epoch, queue)) = batch else { break };
            self.process_batch(epoch, queue);
            (self.epoch_done)(epoch);
        }
        log::debug!(target: "gc", "Finalizer thread finishes execution");
    }

    /// Runs the batch sequentially. Each object's memory is released only
    /// after its finalizer ran; the extra record was unlinked by the sweep
    /// and is destroyed here.
    fn process_batch(&self, epoch: i64, mut queue: FinalizerQueue) {
        let objects = queue.take();
        log::debug!(
            target: "gc",
            "Epoch #{}: running {} finalizers",
            epoch,
            objects.len()
        );
        for obj in objects {
            self.finalize_object(obj);
        }
    }

    fn finalize_object(&self, obj: ObjRef) {
        unsafe {
            let extra = (*obj).extra();
            debug_assert!(!extra.is_null(), "finalizable object without extra data");
            let finalizer = (*extra)
                .finalizer()
                .expect("queued object carries a finalizer");
            finalizer(obj);
            (*extra).set_flag(EXTRA_FLAG_FINALIZED);
            (*obj).clear_extra();
            drop(Box::from_raw(extra));
        }
        self.allocator.free_reclaimed(obj);
    }
}
