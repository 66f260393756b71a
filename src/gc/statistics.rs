//! Per-epoch timeline and counters. A `GcHandle` is the statistics sink a
//! single collection writes its milestones into; handles are cheap clones
//! addressed by epoch.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

#[derive(Default)]
struct Timeline {
    suspension_requested: Option<Duration>,
    threads_suspended: Option<Duration>,
    threads_resumed: Option<Duration>,
    finished: Option<Duration>,
    finalizers_done: Option<Duration>,
}

pub struct EpochStats {
    epoch: i64,
    created: Instant,
    timeline: Mutex<Timeline>,
    root_sets_claimed: AtomicUsize,
    roots_scanned: AtomicUsize,
    objects_marked: AtomicUsize,
    objects_swept: AtomicUsize,
    extras_swept: AtomicUsize,
    finalizers_scheduled: AtomicUsize,
}

impl EpochStats {
    fn new(epoch: i64) -> Self {
        Self {
            epoch,
            created: Instant::now(),
            timeline: Mutex::new(Timeline::default()),
            root_sets_claimed: AtomicUsize::new(0),
            roots_scanned: AtomicUsize::new(0),
            objects_marked: AtomicUsize::new(0),
            objects_swept: AtomicUsize::new(0),
            extras_swept: AtomicUsize::new(0),
            finalizers_scheduled: AtomicUsize::new(0),
        }
    }
}

/// Handle recording the milestones of one collection epoch.
#[derive(Clone)]
pub struct GcHandle {
    stats: Arc<EpochStats>,
}

impl GcHandle {
    pub fn epoch(&self) -> i64 {
        self.stats.epoch
    }

    fn elapsed(&self) -> Duration {
        self.stats.created.elapsed()
    }

    pub fn suspension_requested(&self) {
        let at = self.elapsed();
        self.stats.timeline.lock().suspension_requested = Some(at);
        log::debug!(target: "gc", "Epoch #{}: suspension requested (+{:?})", self.epoch(), at);
    }

    pub fn threads_are_suspended(&self) {
        let at = self.elapsed();
        self.stats.timeline.lock().threads_suspended = Some(at);
        log::debug!(target: "gc", "Epoch #{}: world is stopped (+{:?})", self.epoch(), at);
    }

    pub fn threads_are_resumed(&self) {
        let at = self.elapsed();
        self.stats.timeline.lock().threads_resumed = Some(at);
        log::debug!(target: "gc", "Epoch #{}: world is resumed (+{:?})", self.epoch(), at);
    }

    pub fn finished(&self) {
        let at = self.elapsed();
        self.stats.timeline.lock().finished = Some(at);
        log::debug!(
            target: "gc",
            "Epoch #{}: finished in {:?} (marked {} swept {} extras {})",
            self.epoch(),
            at,
            self.marked(),
            self.swept(),
            self.extras_swept(),
        );
    }

    pub fn finalizers_scheduled(&self, count: usize) {
        self.stats
            .finalizers_scheduled
            .store(count, Ordering::Release);
        log::debug!(target: "gc", "Epoch #{}: {} finalizers scheduled", self.epoch(), count);
    }

    pub fn finalizers_done(&self) {
        let at = self.elapsed();
        self.stats.timeline.lock().finalizers_done = Some(at);
        log::debug!(target: "gc", "Epoch #{}: finalizers done (+{:?})", self.epoch(), at);
    }

    pub fn root_set_claimed(&self) {
        self.stats.root_sets_claimed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn add_roots_scanned(&self, count: usize) {
        self.stats.roots_scanned.fetch_add(count, Ordering::AcqRel);
    }

    pub fn add_marked(&self, count: usize) {
        self.stats.objects_marked.fetch_add(count, Ordering::AcqRel);
    }

    pub fn add_swept(&self, count: usize) {
        self.stats.objects_swept.fetch_add(count, Ordering::AcqRel);
    }

    pub fn add_extras_swept(&self, count: usize) {
        self.stats.extras_swept.fetch_add(count, Ordering::AcqRel);
    }

    pub fn root_sets_claimed(&self) -> usize {
        self.stats.root_sets_claimed.load(Ordering::Acquire)
    }

    pub fn roots_scanned(&self) -> usize {
        self.stats.roots_scanned.load(Ordering::Acquire)
    }

    pub fn marked(&self) -> usize {
        self.stats.objects_marked.load(Ordering::Acquire)
    }

    pub fn swept(&self) -> usize {
        self.stats.objects_swept.load(Ordering::Acquire)
    }

    pub fn extras_swept(&self) -> usize {
        self.stats.extras_swept.load(Ordering::Acquire)
    }

    pub fn scheduled_finalizers(&self) -> usize {
        self.stats.finalizers_scheduled.load(Ordering::Acquire)
    }

    pub fn finalizers_done_at(&self) -> Option<Duration> {
        self.stats.timeline.lock().finalizers_done
    }

    pub fn finished_at(&self) -> Option<Duration> {
        self.stats.timeline.lock().finished
    }
}

/// Statistics sink keeping the most recent epochs around for inspection.
pub struct GcStatistics {
    epochs: Mutex<Vec<Arc<EpochStats>>>,
}

const KEPT_EPOCHS: usize = 8;

impl GcStatistics {
    pub fn new() -> Self {
        Self {
            epochs: Mutex::new(Vec::new()),
        }
    }

    pub fn create(&self, epoch: i64) -> GcHandle {
        let stats = Arc::new(EpochStats::new(epoch));
        let mut epochs = self.epochs.lock();
        epochs.push(stats.clone());
        if epochs.len() > KEPT_EPOCHS {
            epochs.remove(0);
        }
        GcHandle { stats }
    }

    pub fn by_epoch(&self, epoch: i64) -> Option<GcHandle> {
        self.epochs
            .lock()
            .iter()
            .find(|s| s.epoch == epoch)
            .map(|s| GcHandle { stats: s.clone() })
    }
}

impl Default for GcStatistics {
    fn default() -> Self {
        Self::new()
    }
}
