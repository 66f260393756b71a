//! Parallel mark dispatcher: distributes mark work between the main GC
//! thread, dedicated auxiliary threads and, when enabled, mutators paused at
//! a safepoint. All participants share one logical worklist with
//! work-stealing semantics; termination is a non-blocking quiescence
//! protocol over a global active-worker count.

use std::{sync::Arc, time::Duration};

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use rand::distributions::{Distribution, Uniform};
use rand::thread_rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::alloc::Allocator;
use crate::gc::mark;
use crate::gc::mutator::{ThreadData, ThreadRegistry, STATE_RUNNABLE};
use crate::gc::statistics::GcHandle;
use crate::gc::suspension::SuspensionCoordinator;
use crate::object::ObjRef;
use crate::sync::Monitor;

const SEGMENT_SIZE: usize = 64;
const OVERFLOW_THRESHOLD: usize = 256;

/// Poison value parked in the active-worker count once marking completed;
/// keeps late joiners out of a finished epoch.
const ACTIVE_POISON: usize = usize::MAX;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Idle,
    /// Epoch armed; suspension is being established.
    Armed,
    /// Workers are marking.
    Marking,
}

struct PhaseState {
    generation: u64,
    phase: Phase,
    shutdown: bool,
    handle: Option<GcHandle>,
}

struct WorkerPool {
    workers: Vec<Option<Worker<usize>>>,
    stealers: Vec<Stealer<usize>>,
}

impl WorkerPool {
    fn new(parallelism: usize) -> Self {
        let mut workers = Vec::with_capacity(parallelism);
        let mut stealers = Vec::with_capacity(parallelism);
        for _ in 0..parallelism {
            let w = Worker::new_lifo();
            stealers.push(w.stealer());
            workers.push(Some(w));
        }
        Self { workers, stealers }
    }
}

/// One marker's execution context: a claimed deque slot plus a small local
/// segment buffer.
struct MarkerContext {
    id: usize,
    worker: Worker<usize>,
    stealers: Vec<Stealer<usize>>,
    local: Vec<usize>,
    marked: usize,
    since_overflow: usize,
}

impl MarkerContext {
    fn push(&mut self, obj: ObjRef, injector: &Injector<usize>) {
        if self.local.len() < SEGMENT_SIZE {
            self.local.push(obj as usize);
            self.defensive_push(injector);
        } else {
            self.worker.push(obj as usize);
        }
    }

    /// Periodically spills half of a long local buffer to the injector so
    /// idle workers find stealable work.
    fn defensive_push(&mut self, injector: &Injector<usize>) {
        self.since_overflow += 1;
        if self.since_overflow > OVERFLOW_THRESHOLD {
            if self.local.len() > 4 {
                let target = self.local.len() / 2;
                while self.local.len() > target {
                    injector.push(self.local.pop().unwrap());
                }
            }
            self.since_overflow = 0;
        }
    }
}

pub struct MarkDispatcher {
    registry: Arc<ThreadRegistry>,
    suspension: Arc<SuspensionCoordinator>,
    allocator: Arc<dyn Allocator>,
    injector: Injector<usize>,
    pool: parking_lot::Mutex<WorkerPool>,
    phase: Monitor<PhaseState>,
    active: AtomicUsize,
    complete: AtomicBool,
    global_roots_claimed: AtomicBool,
    mutators_cooperate: AtomicBool,
    single_threaded: bool,
}

impl MarkDispatcher {
    pub fn new(
        registry: Arc<ThreadRegistry>,
        suspension: Arc<SuspensionCoordinator>,
        allocator: Arc<dyn Allocator>,
        max_parallelism: usize,
        mutators_cooperate: bool,
        single_threaded: bool,
    ) -> Self {
        let parallelism = max_parallelism.max(1);
        Self {
            registry,
            suspension,
            allocator,
            injector: Injector::new(),
            pool: parking_lot::Mutex::new(WorkerPool::new(parallelism)),
            phase: Monitor::new(PhaseState {
                generation: 0,
                phase: Phase::Idle,
                shutdown: false,
                handle: None,
            }),
            active: AtomicUsize::new(0),
            complete: AtomicBool::new(false),
            global_roots_claimed: AtomicBool::new(false),
            mutators_cooperate: AtomicBool::new(mutators_cooperate),
            single_threaded,
        }
    }

    /// Arms the marking epoch: clears the per-mutator mark flags,
    /// reinitializes the worklist state and publishes the per-epoch handle.
    pub fn begin_marking_epoch(&self, handle: GcHandle) {
        for td in self.registry.snapshot() {
            td.clear_mark_flags();
        }
        self.global_roots_claimed.store(false, Ordering::Release);
        self.active.store(0, Ordering::Release);
        self.complete.store(false, Ordering::Release);
        debug_assert!(self.injector.is_empty());

        let mut g = self.phase.lock();
        assert_eq!(g.phase, Phase::Idle, "marking epoch already in progress");
        g.generation += 1;
        g.phase = Phase::Armed;
        log::debug!(
            target: "gc",
            "Epoch #{}: marking armed (generation {})",
            handle.epoch(),
            g.generation
        );
        g.handle = Some(handle);
        g.notify_all();
    }

    /// Blocks until every mutator has stopped mutating: parked, in native
    /// code, or cooperating with this epoch's mark.
    pub fn wait_mutators_paused(&self) {
        self.suspension
            .wait_until(|td| td.exec_state() != STATE_RUNNABLE || td.cooperative());
        log::debug!(target: "gc", "All threads have paused mutation");
    }

    /// Runs the main GC thread's share of marking and blocks until marking
    /// is globally complete. On return every reachable heap object is
    /// marked.
    pub fn run_main_in_stw(&self) {
        let handle = {
            let mut g = self.phase.lock();
            assert_eq!(g.phase, Phase::Armed, "mark epoch was not armed");
            g.phase = Phase::Marking;
            g.notify_all();
            g.handle.clone().expect("armed epoch carries a handle")
        };

        if self.single_threaded {
            let mut queue = Vec::new();
            mark::collect_root_set(&handle, &self.registry, &self.allocator, &mut queue);
            mark::mark_serial(&handle, &mut queue);
            self.complete.store(true, Ordering::Release);
            return;
        }

        self.participate(&handle);
        // the marker pool is bounded: if cooperating mutators claimed every
        // slot, wait out their completion signal
        while !self.marking_complete() {
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    /// Releases the per-epoch barrier and logs mark statistics.
    pub fn end_marking_epoch(&self) {
        let mut g = self.phase.lock();
        assert_eq!(g.phase, Phase::Marking);
        if let Some(handle) = g.handle.take() {
            log::debug!(
                target: "gc",
                "Epoch #{}: marking complete, {} objects marked",
                handle.epoch(),
                handle.marked()
            );
        }
        g.phase = Phase::Idle;
        g.notify_all();
    }

    /// Body of one auxiliary-thread cycle: blocks until a mark begins (or
    /// shutdown), participates, then waits for the epoch to be released.
    pub fn run_auxiliary(&self) {
        let (handle, generation) = {
            let mut g = self.phase.lock();
            loop {
                if g.shutdown {
                    return;
                }
                if g.phase == Phase::Marking {
                    break (
                        g.handle.clone().expect("marking epoch carries a handle"),
                        g.generation,
                    );
                }
                g.wait();
            }
        };

        self.participate(&handle);

        let mut g = self.phase.lock();
        while g.phase == Phase::Marking && g.generation == generation && !g.shutdown {
            g.wait();
        }
    }

    /// Rendezvous for a mutator suspended at a safepoint: when cooperation
    /// is enabled and an epoch is armed, the mutator joins as a marker until
    /// global quiescence, then returns to the suspended wait.
    pub fn run_on_mutator(&self, td: &ThreadData) {
        if self.single_threaded || !self.mutators_cooperate.load(Ordering::Relaxed) {
            return;
        }

        let handle = {
            let mut g = self.phase.lock();
            if g.shutdown || g.phase == Phase::Idle {
                return;
            }
            let generation = g.generation;
            td.begin_cooperation();
            self.suspension.notify_state_change();
            while g.phase == Phase::Armed && g.generation == generation && !g.shutdown {
                g.wait();
            }
            if g.phase != Phase::Marking || g.generation != generation || g.shutdown {
                return;
            }
            g.handle.clone().expect("marking epoch carries a handle")
        };

        log::trace!(target: "gc", "Thread {} cooperates in marking", td.id());
        self.participate(&handle);
    }

    /// Rebuilds the marker pool. Only legal between epochs; `teardown`
    /// drains the existing auxiliary threads.
    pub fn reset(
        &self,
        max_parallelism: usize,
        mutators_cooperate: bool,
        teardown: impl FnOnce(),
    ) {
        {
            let mut g = self.phase.lock();
            assert_eq!(g.phase, Phase::Idle, "reset during an active mark epoch");
            g.shutdown = true;
            g.notify_all();
        }
        teardown();
        {
            let mut g = self.phase.lock();
            g.shutdown = false;
        }
        *self.pool.lock() = WorkerPool::new(max_parallelism.max(1));
        self.mutators_cooperate
            .store(mutators_cooperate, Ordering::Relaxed);
        log::info!(
            target: "gc",
            "Mark dispatcher reconfigured: parallelism {} cooperative mutators {}",
            max_parallelism.max(1),
            mutators_cooperate
        );
    }

    /// Auxiliary threads exit their loop once this is set.
    pub fn request_shutdown(&self) {
        let mut g = self.phase.lock();
        g.shutdown = true;
        g.notify_all();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.phase.lock().shutdown
    }

    pub(crate) fn marking_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    fn claim_context(&self) -> Option<MarkerContext> {
        let mut pool = self.pool.lock();
        let stealers = pool.stealers.clone();
        for (id, slot) in pool.workers.iter_mut().enumerate() {
            if let Some(worker) = slot.take() {
                return Some(MarkerContext {
                    id,
                    worker,
                    stealers,
                    local: Vec::with_capacity(SEGMENT_SIZE),
                    marked: 0,
                    since_overflow: 0,
                });
            }
        }
        None
    }

    fn release_context(&self, ctx: MarkerContext) {
        debug_assert!(ctx.local.is_empty());
        self.pool.lock().workers[ctx.id] = Some(ctx.worker);
    }

    /// One worker's participation in the current mark: claim root sets,
    /// drain the worklist, offer termination; loops while work keeps
    /// reappearing.
    fn participate(&self, handle: &GcHandle) {
        if self.marking_complete() {
            return;
        }
        let Some(mut ctx) = self.claim_context() else {
            // parallelism bound reached, the worklist has enough hands
            return;
        };
        if !self.terminator_enter() {
            self.release_context(ctx);
            return;
        }

        loop {
            self.claim_root_sets(&mut ctx, handle);
            self.drain(&mut ctx);
            if self.offer_termination() {
                break;
            }
        }

        handle.add_marked(ctx.marked);
        self.release_context(ctx);
    }

    /// Claims every mutator whose root set is still unowned in this epoch
    /// (M3: the CAS admits exactly one claimer per mutator).
    fn claim_root_sets(&self, ctx: &mut MarkerContext, handle: &GcHandle) {
        for td in self.registry.snapshot() {
            if td.try_lock_root_set() {
                let mut pushed = Vec::new();
                ctx.marked += mark::scan_thread_root_set(
                    &td,
                    self.allocator.as_ref(),
                    handle,
                    &mut |o| pushed.push(o),
                );
                for obj in pushed {
                    ctx.push(obj, &self.injector);
                }
            }
        }
        if !self.global_roots_claimed.swap(true, Ordering::AcqRel) {
            let mut pushed = Vec::new();
            ctx.marked += mark::scan_global_root_set(&self.registry, handle, &mut |o| {
                pushed.push(o)
            });
            for obj in pushed {
                ctx.push(obj, &self.injector);
            }
        }
    }

    fn drain(&self, ctx: &mut MarkerContext) {
        while let Some(addr) = self.pop_task(ctx) {
            let obj = addr as ObjRef;
            let mut pushed = Vec::new();
            ctx.marked += mark::process_gray(obj, &mut |o| pushed.push(o));
            for o in pushed {
                ctx.push(o, &self.injector);
            }
        }
    }

    fn pop_task(&self, ctx: &mut MarkerContext) -> Option<usize> {
        if let Some(addr) = ctx.local.pop() {
            return Some(addr);
        }
        if let Some(addr) = ctx.worker.pop() {
            return Some(addr);
        }
        self.pop_global(ctx).or_else(|| self.steal(ctx))
    }

    fn pop_global(&self, ctx: &MarkerContext) -> Option<usize> {
        loop {
            match self.injector.steal_batch_and_pop(&ctx.worker) {
                Steal::Empty => return None,
                Steal::Success(addr) => return Some(addr),
                Steal::Retry => continue,
            }
        }
    }

    fn steal(&self, ctx: &MarkerContext) -> Option<usize> {
        let n = ctx.stealers.len();
        if n <= 1 {
            return None;
        }

        let mut rng = thread_rng();
        let range = Uniform::new(0, n);

        for _ in 0..2 * n {
            let mut victim = ctx.id;
            while victim == ctx.id {
                victim = range.sample(&mut rng);
            }

            loop {
                match ctx.stealers[victim].steal_batch_and_pop(&ctx.worker) {
                    Steal::Empty => break,
                    Steal::Success(addr) => return Some(addr),
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    /// True when the shared worklist is drained and every root set was
    /// claimed. Conclusive only while the active-worker count is zero.
    fn no_work_left(&self) -> bool {
        if !self.injector.is_empty() {
            return false;
        }
        {
            let pool = self.pool.lock();
            if pool.stealers.iter().any(|s| !s.is_empty()) {
                return false;
            }
        }
        if !self.global_roots_claimed.load(Ordering::Acquire) {
            return false;
        }
        self.registry.snapshot().iter().all(|td| td.root_set_locked())
    }

    /// Registers the caller as an active marker. Fails once the epoch's
    /// marking has completed.
    fn terminator_enter(&self) -> bool {
        let mut active = self.active.load(Ordering::Acquire);
        loop {
            if active == ACTIVE_POISON {
                return false;
            }
            match self.active.compare_exchange_weak(
                active,
                active + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(v) => active = v,
            }
        }
    }

    /// Quiescence offer: deregisters the caller, then spins until marking
    /// either completes or work reappears. A worker that decremented the
    /// count to zero and still observes an empty worklist poisons the count
    /// and declares `marking_complete`; the poison keeps every pushed task
    /// ordered before the completion decision. Returns true when the caller
    /// should stop marking; false after it re-registered for more work.
    fn offer_termination(&self) -> bool {
        self.active.fetch_sub(1, Ordering::AcqRel);
        loop {
            if self.marking_complete() {
                return true;
            }
            if self.no_work_left() {
                if self
                    .active
                    .compare_exchange(0, ACTIVE_POISON, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.complete.store(true, Ordering::Release);
                    self.phase.notify_all();
                    return true;
                }
                std::thread::sleep(Duration::from_micros(1));
            } else {
                // work reappeared; re-register before touching it
                if self.terminator_enter() {
                    return false;
                }
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{AllocatorKind, HeapAccounting};
    use crate::gc::statistics::GcStatistics;
    use crate::object::{set_reference, TypeInfo};

    static PAIR: TypeInfo = TypeInfo::object("pair", 2);

    fn dispatcher(parallelism: usize) -> (Arc<MarkDispatcher>, Arc<ThreadRegistry>, Arc<dyn Allocator>) {
        let registry = Arc::new(ThreadRegistry::new());
        let suspension = Arc::new(SuspensionCoordinator::new(registry.clone()));
        let allocator: Arc<dyn Allocator> =
            AllocatorKind::ObjectFactory.build(HeapAccounting::new(usize::MAX));
        let dispatcher = Arc::new(MarkDispatcher::new(
            registry.clone(),
            suspension,
            allocator.clone(),
            parallelism,
            false,
            false,
        ));
        (dispatcher, registry, allocator)
    }

    #[test]
    fn test_parallel_mark_traverses_thread_roots() {
        let (dispatcher, registry, allocator) = dispatcher(4);
        let stats = GcStatistics::new();
        let handle = stats.create(1);

        // one registered mutator with a three-object chain rooted
        let td = registry.register();
        let a = allocator.create_object(&td, &PAIR).unwrap();
        let b = allocator.create_object(&td, &PAIR).unwrap();
        let c = allocator.create_object(&td, &PAIR).unwrap();
        unsafe {
            set_reference(a, 0, b);
            set_reference(b, 1, c);
        }
        td.add_root(a);

        dispatcher.begin_marking_epoch(handle.clone());
        {
            let mut g = dispatcher.phase.lock();
            g.phase = Phase::Marking;
        }

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                let handle = handle.clone();
                std::thread::spawn(move || dispatcher.participate(&handle))
            })
            .collect();
        dispatcher.participate(&handle);
        for w in workers {
            w.join().unwrap();
        }

        assert!(dispatcher.marking_complete());
        assert_eq!(handle.marked(), 3);
        assert_eq!(handle.root_sets_claimed(), 1);
        for obj in [a, b, c] {
            assert!(crate::factory::is_marked(obj));
        }
        dispatcher.end_marking_epoch();
    }

    #[test]
    fn test_late_participant_is_turned_away_after_completion() {
        let (dispatcher, registry, _allocator) = dispatcher(2);
        let stats = GcStatistics::new();
        let handle = stats.create(1);
        let _td = registry.register();

        dispatcher.begin_marking_epoch(handle.clone());
        {
            let mut g = dispatcher.phase.lock();
            g.phase = Phase::Marking;
        }
        dispatcher.participate(&handle);
        assert!(dispatcher.marking_complete());

        // a marker arriving now must not re-open the epoch
        dispatcher.participate(&handle);
        assert!(dispatcher.marking_complete());
        dispatcher.end_marking_epoch();
    }
}
