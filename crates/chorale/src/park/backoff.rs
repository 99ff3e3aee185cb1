//! Randomized retry backoff
//!
//! Claim contention in the lock-free engine is resolved by retrying, and
//! retrying in lockstep just collides again. Each thread therefore carries
//! its own jittered backoff: a few spins first, then yields, then short
//! sleeps, with the counts perturbed by a per-thread random stream so
//! contending threads desynchronize.

use std::hash::{Hash, Hasher};
use std::time::Duration;

use rustc_hash::FxHasher;

const SPIN_STEPS: u32 = 6;
const YIELD_STEPS: u32 = 10;
const SLEEP_CAP_US: u64 = 500;

/// Per-thread escalating backoff with jitter.
#[derive(Debug)]
pub(crate) struct Backoff {
    step: u32,
    rng: u64,
}

impl Backoff {
    /// A fresh backoff seeded from the current thread's identity, so two
    /// contending threads never share a jitter stream.
    pub(crate) fn new() -> Self {
        let mut hasher = FxHasher::default();
        std::thread::current().id().hash(&mut hasher);
        Self {
            step: 0,
            rng: hasher.finish() | 1,
        }
    }

    fn next_rand(&mut self) -> u64 {
        // xorshift64; quality is irrelevant, decorrelation is the point.
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng = x;
        x
    }

    /// Wait once, escalating on each successive call.
    pub(crate) fn pause(&mut self) {
        let step = self.step;
        self.step = self.step.saturating_add(1);
        if step < SPIN_STEPS {
            let spins = (1u32 << step) + (self.next_rand() as u32 & 0xf);
            for _ in 0..spins {
                std::hint::spin_loop();
            }
        } else if step < SPIN_STEPS + YIELD_STEPS {
            std::thread::yield_now();
        } else {
            let us = 1 + self.next_rand() % SLEEP_CAP_US;
            std::thread::sleep(Duration::from_micros(us));
        }
    }

    /// Back to the cheap end of the ladder after forward progress.
    pub(crate) fn reset(&mut self) {
        self.step = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalates_and_resets() {
        let mut b = Backoff::new();
        for _ in 0..(SPIN_STEPS + YIELD_STEPS + 2) {
            b.pause();
        }
        assert!(b.step > SPIN_STEPS + YIELD_STEPS);
        b.reset();
        assert_eq!(b.step, 0);
    }

    #[test]
    fn jitter_streams_advance() {
        let mut b = Backoff::new();
        let a = b.next_rand();
        let c = b.next_rand();
        assert_ne!(a, c);
    }
}
