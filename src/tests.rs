//! End-to-end collection scenarios driving the public API with real mutator
//! threads.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::alloc::AllocatorKind;
use crate::factory::{allocated_heap_size, is_marked};
use crate::gc::{CollectorKind, GarbageCollector, GcConfig, Mutator};
use crate::object::{get_reference, set_reference, ObjRef, TypeInfo};

static CELL: TypeInfo = TypeInfo::object("cell", 1);
static PAIR: TypeInfo = TypeInfo::object("pair", 2);
static TRIPLE: TypeInfo = TypeInfo::object("triple", 3);
static REFS: TypeInfo = TypeInfo::array("refs");

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn stms() -> GcConfig {
    GcConfig {
        collector: CollectorKind::SameThreadMarkSweep,
        ..Default::default()
    }
}

fn cms() -> GcConfig {
    GcConfig {
        collector: CollectorKind::ParallelMarkConcurrentSweep,
        aux_gc_threads: 2,
        mutators_cooperate: true,
        ..Default::default()
    }
}

/// Schedules a collection from an attached mutator and waits it out in
/// native state.
fn trigger_gc(gc: &GarbageCollector, m: &Mutator) -> i64 {
    m.native(|| {
        let epoch = gc.schedule();
        gc.wait_finished(epoch);
        epoch
    })
}

#[test]
fn test_linear_chain_survives() {
    init_logging();
    let gc = GarbageCollector::new(stms());
    let m = gc.attach();

    let objs: Vec<ObjRef> = (0..10).map(|_| m.create_object(&CELL)).collect();
    for i in 0..9 {
        unsafe { set_reference(objs[i], 0, objs[i + 1]) };
    }
    let _root = m.add_root(objs[0]);

    let before = gc.allocated_bytes();
    let epoch = trigger_gc(&gc, &m);

    assert_eq!(gc.allocated_bytes(), before);
    let stats = gc.epoch_statistics(epoch).unwrap();
    assert_eq!(stats.marked(), 10);
    assert_eq!(stats.scheduled_finalizers(), 0);
    // survivors enter the next epoch unmarked
    assert!(!is_marked(objs[0]));
    unsafe {
        assert_eq!(get_reference(objs[8], 0), objs[9]);
    }
    drop(m);
    gc.clear_for_tests();
}

#[test]
fn test_dropped_tail_is_reclaimed() {
    init_logging();
    let gc = GarbageCollector::new(stms());
    let m = gc.attach();

    let objs: Vec<ObjRef> = (0..10).map(|_| m.create_object(&CELL)).collect();
    for i in 0..9 {
        unsafe { set_reference(objs[i], 0, objs[i + 1]) };
    }
    let _root = m.add_root(objs[0]);

    unsafe { set_reference(objs[0], 0, std::ptr::null_mut()) };
    let epoch = trigger_gc(&gc, &m);

    assert_eq!(gc.allocated_bytes(), allocated_heap_size(objs[0]));
    let stats = gc.epoch_statistics(epoch).unwrap();
    assert_eq!(stats.marked(), 1);
    assert_eq!(stats.swept(), 9);
    assert_eq!(stats.scheduled_finalizers(), 0);
    drop(m);
    gc.clear_for_tests();
}

#[test]
fn test_unreferenced_cycle_is_reclaimed() {
    init_logging();
    let gc = GarbageCollector::new(stms());
    let m = gc.attach();

    let b0 = m.create_object(&PAIR);
    let b1 = m.create_object(&PAIR);
    unsafe {
        set_reference(b0, 0, b1);
        set_reference(b1, 0, b0);
    }
    let root = m.add_root(b0);
    m.remove_root(&root);

    trigger_gc(&gc, &m);
    assert_eq!(gc.allocated_bytes(), 0);
    drop(m);
}

static FINALIZED_COUNT: AtomicUsize = AtomicUsize::new(0);

fn counting_finalizer(_: ObjRef) {
    FINALIZED_COUNT.fetch_add(1, Ordering::SeqCst);
}

static FINALIZABLE: TypeInfo = TypeInfo::finalized("finalizable", 0, counting_finalizer);

#[test]
fn test_finalizer_runs_before_memory_is_freed() {
    init_logging();
    let gc = GarbageCollector::new(stms());
    let m = gc.attach();

    let c = m.create_object(&FINALIZABLE);
    m.create_extra_object_data_for_object(c, &FINALIZABLE);
    let root = m.add_root(c);
    root.clear();

    let before = FINALIZED_COUNT.load(Ordering::SeqCst);
    let epoch = trigger_gc(&gc, &m);

    let stats = gc.epoch_statistics(epoch).unwrap();
    assert_eq!(stats.scheduled_finalizers(), 1);

    m.native(|| gc.wait_finalizers(epoch));
    assert_eq!(FINALIZED_COUNT.load(Ordering::SeqCst), before + 1);
    assert_eq!(gc.allocated_bytes(), 0);
    assert!(stats.finalizers_done_at().is_some());
    drop(m);
    gc.clear_for_tests();
}

#[test]
fn test_oom_triggers_synchronous_collection() {
    init_logging();
    let gc = GarbageCollector::new(stms());
    let m = gc.attach();

    let keep = m.create_object(&CELL);
    let _root = m.add_root(keep);
    for _ in 0..7 {
        m.create_object(&CELL);
    }
    // no headroom left: the next allocation must collect the seven dead
    // cells and then succeed
    gc.set_memory_limit(gc.allocated_bytes());

    let fresh = m.create_object(&CELL);
    assert!(!fresh.is_null());
    assert!(gc.epoch_statistics(1).is_some());
    drop(m);
    gc.clear_for_tests();
}

#[test]
fn test_weak_reference_is_cleared_stw() {
    init_logging();
    let gc = GarbageCollector::new(stms());
    let m = gc.attach();

    let d = m.create_object(&CELL);
    let live = m.create_object(&CELL);
    let _root = m.add_root(live);
    let w_dead = m.new_weak(d);
    let w_live = m.new_weak(live);

    trigger_gc(&gc, &m);
    assert_eq!(w_dead.get(), None);
    assert_eq!(w_live.get(), Some(live));
    drop(m);
    gc.clear_for_tests();
}

#[test]
fn test_concurrent_weak_sweep_clears_and_filters() {
    init_logging();
    let mut config = cms();
    config.concurrent_weak_sweep = true;
    let gc = GarbageCollector::new(config);
    let m = gc.attach();

    let d = m.create_object(&CELL);
    let w = m.new_weak(d);

    std::thread::scope(|scope| {
        let gc = &gc;
        let w2 = w.clone();
        let reader = scope.spawn(move || {
            let reader_mutator = gc.attach();
            let mut observed_null = false;
            for _ in 0..10_000 {
                reader_mutator.safepoint();
                match w2.get() {
                    // the barrier (or the processor) may already filter the
                    // dead target; it must never yield a torn value
                    None => observed_null = true,
                    Some(obj) => assert!(!obj.is_null()),
                }
                std::thread::yield_now();
            }
            observed_null
        });

        trigger_gc(gc, &m);
        reader.join().unwrap();
    });

    assert_eq!(w.get(), None);
    assert_eq!(gc.allocated_bytes(), 0);
    drop(m);
}

#[test]
fn test_parallel_collection_with_many_mutators() {
    init_logging();
    let gc = GarbageCollector::new(cms());

    std::thread::scope(|scope| {
        let gc = &gc;
        let workers: Vec<_> = (0..4)
            .map(|t| {
                scope.spawn(move || {
                    let m = gc.attach();
                    let mut roots = Vec::new();
                    for i in 0..200 {
                        let head = m.create_object(&TRIPLE);
                        let tail = m.create_object(&TRIPLE);
                        unsafe { set_reference(head, t % 3, tail) };
                        if i % 4 == 0 {
                            roots.push((m.add_root(head), head, tail));
                        }
                        m.safepoint();
                    }
                    // every rooted pair must survive the collections below
                    m.native(|| {
                        let epoch = gc.schedule();
                        gc.wait_finished(epoch);
                    });
                    for _ in 0..50 {
                        m.safepoint();
                        std::thread::yield_now();
                    }
                    for (_root, head, tail) in &roots {
                        unsafe {
                            assert_eq!(get_reference(*head, t % 3), *tail);
                        }
                    }
                    roots.len()
                })
            })
            .collect();

        let rooted: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
        assert_eq!(rooted, 4 * 50);
    });

    // with every mutator detached, one more cycle empties the heap
    gc.schedule_and_wait_finished();
    assert_eq!(gc.allocated_bytes(), 0);
}

#[test]
fn test_root_set_claimed_exactly_once_per_mutator() {
    init_logging();
    let gc = GarbageCollector::new(cms());
    let barrier = std::sync::Barrier::new(5);

    std::thread::scope(|scope| {
        let gc = &gc;
        let barrier = &barrier;
        for _ in 0..4 {
            scope.spawn(move || {
                let m = gc.attach();
                let obj = m.create_object(&PAIR);
                let _root = m.add_root(obj);
                m.native(|| {
                    barrier.wait(); // attached and parked
                    barrier.wait(); // collection done
                });
            });
        }

        barrier.wait();
        let epoch = gc.schedule();
        gc.wait_finished(epoch);
        let stats = gc.epoch_statistics(epoch).unwrap();
        assert_eq!(stats.root_sets_claimed(), 4);
        assert_eq!(stats.roots_scanned(), 4);
        barrier.wait();
    });
}

fn randomized_round(config: GcConfig, seed: u64) {
    let gc = GarbageCollector::new(config);
    let m = gc.attach();
    let mut rng = StdRng::seed_from_u64(seed);

    const N: usize = 120;
    let objs: Vec<ObjRef> = (0..N).map(|_| m.create_object(&TRIPLE)).collect();
    let mut edges = vec![[usize::MAX; 3]; N];
    for (i, obj) in objs.iter().enumerate() {
        for slot in 0..3 {
            if rng.gen_bool(0.6) {
                let target = rng.gen_range(0..N);
                edges[i][slot] = target;
                unsafe { set_reference(*obj, slot, objs[target]) };
            }
        }
    }

    let mut roots = Vec::new();
    let mut rooted = Vec::new();
    for (i, obj) in objs.iter().enumerate() {
        if rng.gen_bool(0.1) {
            roots.push(m.add_root(*obj));
            rooted.push(i);
        }
    }
    let weaks: Vec<_> = objs.iter().map(|o| m.new_weak(*o)).collect();

    // mirror reachability over the edge list
    let mut reachable = vec![false; N];
    let mut stack = rooted.clone();
    while let Some(i) = stack.pop() {
        if std::mem::replace(&mut reachable[i], true) {
            continue;
        }
        for slot in 0..3 {
            let t = edges[i][slot];
            if t != usize::MAX && !reachable[t] {
                stack.push(t);
            }
        }
    }
    let expected: usize = reachable.iter().filter(|r| **r).count();
    let unit = allocated_heap_size(objs[0]);

    trigger_gc(&gc, &m);

    // no live loss, full reclamation
    assert_eq!(gc.allocated_bytes(), expected * unit);
    for (i, weak) in weaks.iter().enumerate() {
        if reachable[i] {
            assert_eq!(weak.get(), Some(objs[i]));
        } else {
            assert_eq!(weak.get(), None);
        }
    }
    // the surviving graph is intact
    for i in 0..N {
        if !reachable[i] {
            continue;
        }
        for slot in 0..3 {
            let t = edges[i][slot];
            if t != usize::MAX {
                unsafe { assert_eq!(get_reference(objs[i], slot), objs[t]) };
            }
        }
    }

    drop(roots);
    drop(m);
    gc.clear_for_tests();
}

#[test]
fn test_randomized_graphs_stms() {
    init_logging();
    randomized_round(stms(), 7);
    randomized_round(stms(), 8);
}

#[test]
fn test_randomized_graphs_cms() {
    init_logging();
    randomized_round(cms(), 9);
    randomized_round(cms(), 10);
}

#[test]
fn test_randomized_graphs_pooled_heap() {
    init_logging();
    let mut config = stms();
    config.allocator = AllocatorKind::PooledHeap;
    randomized_round(config, 11);

    let mut config = cms();
    config.allocator = AllocatorKind::PooledHeap;
    randomized_round(config, 12);
}

#[test]
fn test_reference_arrays_are_traced() {
    init_logging();
    let gc = GarbageCollector::new(stms());
    let m = gc.attach();

    let arr = m.create_array(&REFS, 16);
    let survivors: Vec<ObjRef> = (0..16).map(|_| m.create_object(&CELL)).collect();
    for (i, obj) in survivors.iter().enumerate() {
        unsafe { set_reference(arr, i, *obj) };
    }
    let _root = m.add_root(arr);
    let garbage = m.create_object(&CELL);
    let _ = garbage;

    let epoch = trigger_gc(&gc, &m);
    let stats = gc.epoch_statistics(epoch).unwrap();
    assert_eq!(stats.marked(), 17);
    assert_eq!(stats.swept(), 1);
    drop(m);
    gc.clear_for_tests();
}

#[test]
fn test_global_roots_keep_objects_alive() {
    init_logging();
    let gc = GarbageCollector::new(cms());
    let m = gc.attach();

    let obj = m.create_object(&CELL);
    let global = gc.add_global_root(obj);

    trigger_gc(&gc, &m);
    assert_eq!(gc.allocated_bytes(), allocated_heap_size(obj));

    global.clear();
    trigger_gc(&gc, &m);
    assert_eq!(gc.allocated_bytes(), 0);
    drop(m);
}

#[test]
fn test_single_threaded_mark_configuration() {
    init_logging();
    let mut config = cms();
    config.aux_gc_threads = 0;
    config.mutators_cooperate = false;
    config.mark_single_threaded = true;
    let gc = GarbageCollector::new(config);
    let m = gc.attach();

    let a = m.create_object(&PAIR);
    let b = m.create_object(&PAIR);
    unsafe { set_reference(a, 1, b) };
    let _root = m.add_root(a);
    m.create_object(&PAIR);

    let epoch = trigger_gc(&gc, &m);
    let stats = gc.epoch_statistics(epoch).unwrap();
    assert_eq!(stats.marked(), 2);
    assert_eq!(stats.swept(), 1);
    drop(m);
    gc.clear_for_tests();
}

#[test]
fn test_reconfigure_rebuilds_auxiliary_pool() {
    init_logging();
    let mut config = cms();
    config.aux_gc_threads = 1;
    let gc = GarbageCollector::new(config);
    let m = gc.attach();

    let keep = m.create_object(&CELL);
    let _root = m.add_root(keep);
    trigger_gc(&gc, &m);

    gc.reconfigure(8, true, 3);
    m.create_object(&CELL);
    trigger_gc(&gc, &m);
    assert_eq!(gc.allocated_bytes(), allocated_heap_size(keep));
    drop(m);
    gc.clear_for_tests();
}

#[test]
fn test_finalizer_thread_lifecycle() {
    init_logging();
    let gc = GarbageCollector::new(stms());
    assert!(!gc.finalizers_thread_is_running());
    gc.start_finalizer_thread_if_needed();
    assert!(gc.finalizers_thread_is_running());
    gc.stop_finalizer_thread_if_running();
    assert!(!gc.finalizers_thread_is_running());
}

#[test]
fn test_epochs_are_monotonic_across_collections() {
    init_logging();
    let gc = GarbageCollector::new(stms());
    let m = gc.attach();
    let e1 = trigger_gc(&gc, &m);
    let e2 = trigger_gc(&gc, &m);
    let e3 = trigger_gc(&gc, &m);
    assert!(e1 < e2 && e2 < e3);
    drop(m);
}

#[test]
fn test_detached_thread_allocations_are_swept() {
    init_logging();
    let gc = GarbageCollector::new(cms());

    std::thread::scope(|scope| {
        let gc = &gc;
        scope
            .spawn(move || {
                let m = gc.attach();
                for _ in 0..32 {
                    m.create_object(&CELL);
                }
                // detach publishes the queue
            })
            .join()
            .unwrap();
    });

    gc.schedule_and_wait_finished();
    assert_eq!(gc.allocated_bytes(), 0);
}
