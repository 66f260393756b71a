use std::sync::atomic::{AtomicU8, Ordering};

pub type SharedValue = AtomicU8;

/// Atomic boolean flag shared between GC threads and mutators.
pub struct SharedFlag(SharedValue);

impl SharedFlag {
    pub const fn new() -> Self {
        Self(SharedValue::new(0))
    }

    pub fn set(&self) {
        self.0.store(1, Ordering::Release);
    }

    pub fn unset(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire) == 1
    }

    pub fn is_unset(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }

    pub fn try_set(&self) -> bool {
        if self.is_set() {
            return false;
        }

        self.0
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn try_unset(&self) -> bool {
        if self.is_unset() {
            return false;
        }

        self.0
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

impl Default for SharedFlag {
    fn default() -> Self {
        Self::new()
    }
}
