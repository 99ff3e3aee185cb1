//! One-shot wakeup latch
//!
//! A blocked synchronous sender parks on a `Signal` and is woken exactly
//! once per matched firing. The waiter spins for a caller-supplied budget
//! before touching the mutex, because most wakeups in a busy Join arrive
//! within a short window; the budget comes from [`SpinEstimator`].
//!
//! Signals are reusable: `reset` rearms the latch, and each thread keeps
//! one pooled signal for its lifetime rather than allocating per call.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// A resettable single-wakeup latch.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    set: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Rearm before publishing the message this signal guards.
    pub(crate) fn reset(&self) {
        self.set.store(false, Ordering::Release);
    }

    /// Wake the waiter. Idempotent.
    pub(crate) fn set(&self) {
        self.set.store(true, Ordering::Release);
        // The empty critical section orders the store against a waiter
        // that checked the flag and is about to park.
        drop(self.lock.lock());
        self.cond.notify_all();
    }

    /// Block until `set`, spinning up to `budget` iterations first.
    ///
    /// Returns the number of spins actually consumed, so the caller can
    /// feed the estimator.
    pub(crate) fn wait(&self, budget: u32) -> u32 {
        for spun in 0..budget {
            if self.set.load(Ordering::Acquire) {
                return spun;
            }
            std::hint::spin_loop();
        }
        let mut guard = self.lock.lock();
        while !self.set.load(Ordering::Acquire) {
            self.cond.wait(&mut guard);
        }
        budget
    }
}

thread_local! {
    static LOCAL_SIGNAL: Arc<Signal> = Arc::new(Signal::new());
}

/// The calling thread's pooled signal, rearmed for a fresh wait.
pub(crate) fn local_signal() -> Arc<Signal> {
    LOCAL_SIGNAL.with(|s| {
        s.reset();
        Arc::clone(s)
    })
}

// ============================================================================
// Spin budgeting
// ============================================================================

/// Exponential moving average of observed wakeup spin counts.
///
/// One estimator per channel: how long senders on this channel typically
/// wait tells future senders how long spinning is worth before parking.
#[derive(Debug, Default)]
pub(crate) struct SpinEstimator {
    avg: AtomicU32,
}

const SPIN_FLOOR: u32 = 32;
const SPIN_CEIL: u32 = 4096;

impl SpinEstimator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fold one observed wait into the average.
    pub(crate) fn observe(&self, spins: u32) {
        let prev = self.avg.load(Ordering::Relaxed);
        let next = prev - prev / 4 + spins / 4;
        self.avg.store(next.min(SPIN_CEIL), Ordering::Relaxed);
    }

    /// The spin budget to use before parking.
    pub(crate) fn budget(&self) -> u32 {
        // Double the average so a typical wakeup lands inside the budget.
        (self.avg.load(Ordering::Relaxed) * 2).clamp(SPIN_FLOOR, SPIN_CEIL)
    }
}
