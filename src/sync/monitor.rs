use std::{
    ops::{Deref, DerefMut},
    time::Duration,
};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Mutex paired with a condition variable. The guard exposes `wait` and the
/// notify operations so state changes and wakeups stay under one lock.
pub struct Monitor<T> {
    mutex: Mutex<T>,
    cv: Condvar,
}

impl<T> Monitor<T> {
    pub const fn new(val: T) -> Self {
        Self {
            mutex: Mutex::new(val),
            cv: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MonitorGuard<'_, T> {
        MonitorGuard {
            guard: self.mutex.lock(),
            cv: &self.cv,
        }
    }

    pub fn notify_all(&self) -> usize {
        self.cv.notify_all()
    }

    pub fn notify_one(&self) -> bool {
        self.cv.notify_one()
    }
}

pub struct MonitorGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    cv: &'a Condvar,
}

impl<'a, T> MonitorGuard<'a, T> {
    pub fn wait(&mut self) {
        self.cv.wait(&mut self.guard);
    }

    pub fn wait_for(&mut self, timeout: Duration) -> bool {
        !self.cv.wait_for(&mut self.guard, timeout).timed_out()
    }

    pub fn wait_while(&mut self, mut condition: impl FnMut(&mut T) -> bool) {
        while condition(&mut self.guard) {
            self.cv.wait(&mut self.guard);
        }
    }

    pub fn notify_one(&self) -> bool {
        self.cv.notify_one()
    }

    pub fn notify_all(&self) -> usize {
        self.cv.notify_all()
    }
}

impl<'a, T> Deref for MonitorGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<'a, T> DerefMut for MonitorGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}
