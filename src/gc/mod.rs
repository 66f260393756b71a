//! Collector facade: one `GarbageCollector` value per runtime owning the
//! main GC thread, the mark dispatcher with its auxiliary workers, the
//! finalizer pipeline and the epoch state; mutator threads attach to obtain
//! a `Mutator` handle.

pub mod cms;
pub mod dispatcher;
pub mod finalizer;
pub mod mark;
pub mod mutator;
pub mod scheduler;
pub mod state;
pub mod statistics;
pub mod stms;
pub mod suspension;
pub mod sweep;
pub mod weaks;

use std::{sync::Arc, thread::JoinHandle};

use parking_lot::Mutex;

use crate::alloc::{Allocator, AllocatorKind, HeapAccounting};
use crate::formatted_size;
use crate::object::{ExtraObjectData, ObjRef, TypeInfo};

use dispatcher::MarkDispatcher;
use finalizer::FinalizerProcessor;
use mutator::{ThreadData, ThreadRegistry, STATE_NATIVE, STATE_RUNNABLE};
use scheduler::{GcScheduler, LoggingSchedulerPolicy};
use state::GcState;
use statistics::{GcHandle, GcStatistics};
use suspension::SuspensionCoordinator;
use weaks::WeakRefRegistry;

pub use mutator::Root;
pub use scheduler::SchedulerPolicy;
pub use statistics::GcHandle as EpochHandle;
pub use weaks::WeakRef;

/// Collector variant selection.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CollectorKind {
    SameThreadMarkSweep,
    ParallelMarkConcurrentSweep,
}

pub struct GcConfig {
    pub collector: CollectorKind,
    pub allocator: AllocatorKind,
    /// Dedicated mark worker threads (CMS only).
    pub aux_gc_threads: usize,
    /// Upper bound on concurrent markers; 0 derives it from the thread
    /// counts.
    pub max_parallelism: usize,
    /// Suspended mutators take a share of mark work.
    pub mutators_cooperate: bool,
    /// Forces all mark work onto the main GC thread; requires
    /// `aux_gc_threads == 0`.
    pub mark_single_threaded: bool,
    /// Weak processing overlaps mutators under the read-barrier protocol.
    pub concurrent_weak_sweep: bool,
    /// Post-mark heap correctness scan.
    pub runtime_asserts: bool,
    pub memory_limit: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            collector: CollectorKind::ParallelMarkConcurrentSweep,
            allocator: AllocatorKind::ObjectFactory,
            aux_gc_threads: 0,
            max_parallelism: 0,
            mutators_cooperate: false,
            mark_single_threaded: false,
            concurrent_weak_sweep: false,
            runtime_asserts: cfg!(debug_assertions),
            memory_limit: usize::MAX,
        }
    }
}

/// One variant's hooks into the shared collection choreography.
pub(crate) trait CollectorVariant: Send + Sync {
    fn begin_epoch(&self, gc: &GcShared, handle: &GcHandle);
    fn wait_mutators_paused(&self, gc: &GcShared);
    fn run_mark(&self, gc: &GcShared, handle: &GcHandle);
    fn concurrent_weak_sweep(&self) -> bool;
    fn concurrent_sweep(&self) -> bool;
    fn name(&self) -> &'static str;
}

pub(crate) struct GcShared {
    pub(crate) state: Arc<GcState>,
    pub(crate) stats: Arc<GcStatistics>,
    pub(crate) registry: Arc<ThreadRegistry>,
    pub(crate) suspension: Arc<SuspensionCoordinator>,
    pub(crate) dispatcher: Arc<MarkDispatcher>,
    pub(crate) allocator: Arc<dyn Allocator>,
    pub(crate) weaks: Arc<WeakRefRegistry>,
    pub(crate) scheduler: Arc<GcScheduler>,
    pub(crate) finalizers: Arc<FinalizerProcessor>,
    variant: Box<dyn CollectorVariant>,
    /// Serializes collections against reconfiguration.
    gc_mutex: Mutex<()>,
    aux_threads: Mutex<Vec<JoinHandle<()>>>,
    runtime_asserts: bool,
    mark_single_threaded: bool,
    parallel: bool,
}

impl GcShared {
    /// Drives one full collection. The choreography is shared; the variant
    /// decides how marking runs and which stages overlap mutators.
    fn perform_full_gc(&self, epoch: i64) {
        let _gc_lock = self.gc_mutex.lock();
        let handle = self.stats.create(epoch);
        log::debug!(
            target: "gc",
            "Epoch #{}: {} collection started",
            epoch,
            self.variant.name()
        );

        self.variant.begin_epoch(self, &handle);

        assert!(
            self.suspension.request_suspension(),
            "only the main GC thread may request suspension"
        );
        handle.suspension_requested();

        self.variant.wait_mutators_paused(self);
        handle.threads_are_suspended();

        self.scheduler.on_gc_start();
        self.state.start(epoch);

        self.variant.run_mark(self, &handle);

        if self.variant.concurrent_weak_sweep() {
            self.weaks.enable_barriers(epoch);
            self.suspension.resume();
            handle.threads_are_resumed();
        }

        self.weaks.process(&handle);

        if self.variant.concurrent_weak_sweep() {
            // second, short pause of the epoch: tear down the barriers
            assert!(
                self.suspension.request_suspension(),
                "only the main GC thread may request suspension"
            );
            handle.suspension_requested();
            self.suspension.wait_for_suspension();
            handle.threads_are_suspended();
            self.weaks.disable_barriers();
        }

        // All the alive heap is marked; allocations after this point belong
        // to the next epoch. Publish every thread and take the iteration
        // locks before the pause ends, so a thread terminating after resume
        // cannot publish into the global lists mid-sweep.
        for td in self.registry.snapshot() {
            self.allocator.publish_thread_local(&td);
            td.set_published();
        }
        let mut session = self.allocator.begin_sweep();

        if self.runtime_asserts {
            session.verify_marks();
        }

        if self.variant.concurrent_sweep() {
            self.suspension.resume();
            handle.threads_are_resumed();
        }

        let finalizer_queue = session.sweep(&handle, &self.registry);
        drop(session);
        self.allocator.compact_pool();

        self.scheduler
            .on_gc_finish(epoch, self.allocator.allocated_bytes());

        if !self.variant.concurrent_sweep() {
            self.suspension.resume();
            handle.threads_are_resumed();
        }

        self.state.finish(epoch);
        handle.finalizers_scheduled(finalizer_queue.len());
        handle.finished();

        // May start the finalizer thread; no factory or dispatcher locks
        // are held by this point.
        self.finalizers.schedule_tasks(finalizer_queue, epoch);
    }
}

fn main_gc_thread_body(shared: Arc<GcShared>) {
    log::debug!(target: "gc", "Main GC thread starts execution");
    while let Some(epoch) = shared.state.wait_scheduled() {
        shared.perform_full_gc(epoch);
    }
    shared.dispatcher.request_shutdown();
    log::debug!(target: "gc", "Main GC thread finishes execution");
}

fn spawn_auxiliary(shared: &Arc<GcShared>) -> JoinHandle<()> {
    let dispatcher = shared.dispatcher.clone();
    std::thread::Builder::new()
        .name("auxiliary gc thread".into())
        .spawn(move || {
            log::debug!(target: "gc", "Auxiliary GC thread starts execution");
            while !dispatcher.shutdown_requested() {
                dispatcher.run_auxiliary();
            }
            log::debug!(target: "gc", "Auxiliary GC thread finishes execution");
        })
        .expect("failed to spawn auxiliary GC thread")
}

/// The collector. One instance per runtime; constructed at runtime init and
/// dropped at teardown, which shuts the GC threads down and drains the
/// finalizer queue.
pub struct GarbageCollector {
    shared: Arc<GcShared>,
    main_thread: Option<JoinHandle<()>>,
}

impl GarbageCollector {
    pub fn new(config: GcConfig) -> Self {
        Self::with_policy(config, Arc::new(LoggingSchedulerPolicy))
    }

    pub fn with_policy(config: GcConfig, policy: Arc<dyn SchedulerPolicy>) -> Self {
        if config.mark_single_threaded {
            assert_eq!(
                config.aux_gc_threads, 0,
                "auxiliary GC threads must not be created with single-threaded mark"
            );
        }
        let parallel = config.collector == CollectorKind::ParallelMarkConcurrentSweep;
        let aux_gc_threads = if parallel { config.aux_gc_threads } else { 0 };
        let max_parallelism = if config.max_parallelism == 0 {
            1 + aux_gc_threads + if config.mutators_cooperate { 2 } else { 0 }
        } else {
            config.max_parallelism
        };

        let registry = Arc::new(ThreadRegistry::new());
        let suspension = Arc::new(SuspensionCoordinator::new(registry.clone()));
        let state = Arc::new(GcState::new());
        let stats = Arc::new(GcStatistics::new());
        let allocator = config
            .allocator
            .build(HeapAccounting::new(config.memory_limit));
        let scheduler = Arc::new(GcScheduler::new(policy, state.clone()));
        let dispatcher = Arc::new(MarkDispatcher::new(
            registry.clone(),
            suspension.clone(),
            allocator.clone(),
            max_parallelism,
            config.mutators_cooperate,
            config.mark_single_threaded,
        ));

        let epoch_done = {
            let state = state.clone();
            let stats = stats.clone();
            Arc::new(move |epoch: i64| {
                if let Some(handle) = stats.by_epoch(epoch) {
                    handle.finalizers_done();
                }
                state.finalized(epoch);
            })
        };
        let finalizers = Arc::new(FinalizerProcessor::new(allocator.clone(), epoch_done));

        let variant: Box<dyn CollectorVariant> = match config.collector {
            CollectorKind::SameThreadMarkSweep => Box::new(stms::SameThreadMarkSweep),
            CollectorKind::ParallelMarkConcurrentSweep => {
                Box::new(cms::ParallelMarkConcurrentSweep {
                    concurrent_weak_sweep: config.concurrent_weak_sweep,
                })
            }
        };

        let shared = Arc::new(GcShared {
            state,
            stats,
            registry,
            suspension,
            dispatcher,
            allocator,
            weaks: Arc::new(WeakRefRegistry::new()),
            scheduler,
            finalizers,
            variant,
            gc_mutex: Mutex::new(()),
            aux_threads: Mutex::new(Vec::new()),
            runtime_asserts: config.runtime_asserts,
            mark_single_threaded: config.mark_single_threaded,
            parallel,
        });

        let main_thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("main gc thread".into())
                .spawn(move || main_gc_thread_body(shared))
                .expect("failed to spawn main GC thread")
        };

        if parallel && !config.mark_single_threaded {
            let mut aux = shared.aux_threads.lock();
            for _ in 0..aux_gc_threads {
                aux.push(spawn_auxiliary(&shared));
            }
        }

        log::info!(
            target: "gc",
            "{} GC initialized ({} auxiliary threads)",
            match config.collector {
                CollectorKind::SameThreadMarkSweep => "Same thread Mark & Sweep",
                CollectorKind::ParallelMarkConcurrentSweep =>
                    "Parallel Mark & Concurrent Sweep",
            },
            aux_gc_threads
        );

        Self {
            shared,
            main_thread: Some(main_thread),
        }
    }

    /// Attaches the calling thread as a mutator.
    pub fn attach(&self) -> Mutator {
        let thread = self.shared.registry.register();
        let mutator = Mutator {
            gc: self.shared.clone(),
            thread,
        };
        mutator.leave_native();
        for _ in 0..3 {
            mutator.safepoint();
        }
        mutator
    }

    /// Schedules a collection epoch and returns its number.
    pub fn schedule(&self) -> i64 {
        self.shared.state.schedule()
    }

    /// Blocks until `epoch` finished. Callers attached as mutators must be
    /// in native state (see `Mutator::native`).
    pub fn wait_finished(&self, epoch: i64) {
        self.shared.state.wait_epoch_finished(epoch);
    }

    /// Blocks until `epoch`'s finalizers ran.
    pub fn wait_finalizers(&self, epoch: i64) {
        self.shared.state.wait_epoch_finalized(epoch);
    }

    pub fn schedule_and_wait_finished(&self) {
        self.shared.scheduler.schedule_and_wait_finished();
    }

    /// Rebuilds the marker pool and the auxiliary thread set. Only legal
    /// between collections.
    pub fn reconfigure(
        &self,
        max_parallelism: usize,
        mutators_cooperate: bool,
        aux_gc_threads: usize,
    ) {
        if self.shared.mark_single_threaded {
            assert_eq!(
                aux_gc_threads, 0,
                "auxiliary GC threads must not be created with single-threaded mark"
            );
            return;
        }
        if !self.shared.parallel {
            return;
        }
        let _gc_lock = self.shared.gc_mutex.lock();
        self.shared
            .dispatcher
            .reset(max_parallelism.max(1), mutators_cooperate, || {
                for handle in self.shared.aux_threads.lock().drain(..) {
                    handle.join().expect("auxiliary GC thread panicked");
                }
            });
        let mut aux = self.shared.aux_threads.lock();
        for _ in 0..aux_gc_threads {
            aux.push(spawn_auxiliary(&self.shared));
        }
    }

    pub fn start_finalizer_thread_if_needed(&self) {
        self.shared.finalizers.start_thread_if_none();
        self.shared.finalizers.wait_thread_initialized();
    }

    pub fn stop_finalizer_thread_if_running(&self) {
        self.shared.finalizers.stop_thread();
    }

    pub fn finalizers_thread_is_running(&self) -> bool {
        self.shared.finalizers.is_running()
    }

    pub fn add_global_root(&self, obj: ObjRef) -> Root {
        self.shared.registry.add_global_root(obj)
    }

    pub fn allocated_bytes(&self) -> usize {
        self.shared.allocator.allocated_bytes()
    }

    pub fn total_heap_objects_size_bytes(&self) -> usize {
        self.shared.allocator.allocated_bytes()
    }

    pub fn set_memory_limit(&self, bytes: usize) {
        self.shared.allocator.accounting().set_limit(bytes);
    }

    pub fn epoch_statistics(&self, epoch: i64) -> Option<GcHandle> {
        self.shared.stats.by_epoch(epoch)
    }

    /// Stops the finalizer thread and frees every allocation. Test teardown
    /// only.
    pub fn clear_for_tests(&self) {
        self.shared.finalizers.stop_thread();
        self.shared.allocator.clear_all(&self.shared.registry);
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.shared.state.shutdown();
        if let Some(handle) = self.main_thread.take() {
            handle.join().expect("main GC thread panicked");
        }
        for handle in self.shared.aux_threads.lock().drain(..) {
            handle.join().expect("auxiliary GC thread panicked");
        }
        self.shared.finalizers.stop_thread();
    }
}

/// Per-thread mutator handle: allocation entry points, safepoints, roots and
/// weak references. Dropping the handle detaches the thread after publishing
/// its allocation queues.
pub struct Mutator {
    gc: Arc<GcShared>,
    thread: Arc<ThreadData>,
}

impl Mutator {
    pub fn thread_id(&self) -> u64 {
        self.thread.id()
    }

    /// Allocates an ordinary object. An exhausted heap triggers one
    /// synchronous collection before the allocation is retried.
    pub fn create_object(&self, type_info: &'static TypeInfo) -> ObjRef {
        self.allocate_with_gc(|| self.gc.allocator.create_object(&self.thread, type_info))
    }

    pub fn create_array(&self, type_info: &'static TypeInfo, len: usize) -> ObjRef {
        self.allocate_with_gc(|| self.gc.allocator.create_array(&self.thread, type_info, len))
    }

    fn allocate_with_gc(&self, alloc: impl Fn() -> Option<ObjRef>) -> ObjRef {
        if let Some(obj) = alloc() {
            return obj;
        }
        log::debug!(target: "gc", "Attempt to GC on allocation failure");
        self.native(|| self.gc.scheduler.schedule_and_wait_finished());
        alloc().unwrap_or_else(|| {
            panic!(
                "out of memory: heap limit {} exhausted",
                formatted_size(self.gc.allocator.accounting().limit())
            )
        })
    }

    pub fn create_extra_object_data_for_object(
        &self,
        obj: ObjRef,
        type_info: &'static TypeInfo,
    ) -> *mut ExtraObjectData {
        self.gc
            .allocator
            .create_extra_object(&self.thread, obj, type_info)
    }

    pub fn destroy_unattached_extra_object_data(&self, extra: *mut ExtraObjectData) {
        self.gc.allocator.destroy_unattached_extra(extra);
    }

    pub fn new_weak(&self, target: ObjRef) -> WeakRef {
        self.gc.weaks.create(target)
    }

    pub fn add_root(&self, obj: ObjRef) -> Root {
        self.thread.add_root(obj)
    }

    pub fn remove_root(&self, root: &Root) {
        self.thread.remove_root(root);
    }

    /// Cheap poll; the cold path joins the mark (if cooperation is enabled)
    /// and parks until the world resumes.
    #[inline]
    pub fn safepoint(&self) {
        if self.gc.suspension.is_requested() {
            self.safepoint_slow();
        }
    }

    #[cold]
    fn safepoint_slow(&self) {
        self.gc.dispatcher.run_on_mutator(&self.thread);
        self.gc.suspension.park(&self.thread);
    }

    /// Flushes this thread's allocation queues to the global factory state.
    pub fn publish_object_factory(&self) {
        self.gc.allocator.publish_thread_local(&self.thread);
        self.thread.set_published();
    }

    /// Runs `f` in native state: the GC treats the thread as paused and may
    /// collect while `f` blocks. `f` must not touch managed objects.
    pub fn native<R>(&self, f: impl FnOnce() -> R) -> R {
        self.enter_native();
        let result = f();
        self.leave_native();
        result
    }

    fn enter_native(&self) {
        self.thread.set_exec_state(STATE_NATIVE);
        self.gc.suspension.notify_state_change();
    }

    fn leave_native(&self) {
        self.thread.set_exec_state(STATE_RUNNABLE);
        if self.gc.suspension.is_requested() {
            self.safepoint_slow();
        }
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.enter_native();
        // blocks while a sweep holds the iteration locks
        self.gc.allocator.publish_thread_local(&self.thread);
        self.gc.registry.unregister(&self.thread);
    }
}
