//! Bounded in-flight frame counter
//!
//! The scheduler acquires a [`FrameSlot`] before recording a frame and hands
//! it to the backend's completion callback. Dropping the slot (on the
//! backend's notifier thread) releases it. [`FrameLimiter::acquire`] blocks
//! while `max_in_flight` slots are outstanding; there is no timeout.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Counts {
    outstanding: usize,
    peak: usize,
    acquired: u64,
}

#[derive(Debug)]
struct Shared {
    max_in_flight: usize,
    counts: Mutex<Counts>,
    released: Condvar,
}

impl Shared {
    // Counts stay consistent across a panic, so a poisoned lock is still usable
    fn lock(&self) -> MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counting semaphore for frames submitted but not yet completed
#[derive(Debug, Clone)]
pub struct FrameLimiter {
    shared: Arc<Shared>,
}

impl FrameLimiter {
    /// Limiter allowing `max_in_flight` outstanding frames (at least one).
    #[must_use]
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_in_flight: max_in_flight.max(1),
                counts: Mutex::new(Counts::default()),
                released: Condvar::new(),
            }),
        }
    }

    /// Block until a slot is free, then take it.
    #[must_use = "dropping the slot releases it immediately"]
    pub fn acquire(&self) -> FrameSlot {
        let mut counts = self.shared.lock();
        while counts.outstanding >= self.shared.max_in_flight {
            counts = self
                .shared
                .released
                .wait(counts)
                .unwrap_or_else(PoisonError::into_inner);
        }
        self.take(&mut counts)
    }

    /// Take a slot if one is free.
    #[must_use]
    pub fn try_acquire(&self) -> Option<FrameSlot> {
        let mut counts = self.shared.lock();
        (counts.outstanding < self.shared.max_in_flight).then(|| self.take(&mut counts))
    }

    fn take(&self, counts: &mut Counts) -> FrameSlot {
        counts.outstanding += 1;
        counts.acquired += 1;
        counts.peak = counts.peak.max(counts.outstanding);
        FrameSlot {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Block until every outstanding slot has been released.
    pub fn wait_idle(&self) {
        let mut counts = self.shared.lock();
        while counts.outstanding > 0 {
            counts = self
                .shared
                .released
                .wait(counts)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Slots currently held
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.shared.lock().outstanding
    }

    /// Highest number of slots ever held at once
    #[must_use]
    pub fn peak(&self) -> usize {
        self.shared.lock().peak
    }

    /// Total slots handed out
    #[must_use]
    pub fn acquired(&self) -> u64 {
        self.shared.lock().acquired
    }

    /// Configured bound
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight
    }
}

/// One outstanding frame; released on drop
#[derive(Debug)]
pub struct FrameSlot {
    shared: Arc<Shared>,
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        let mut counts = self.shared.lock();
        counts.outstanding = counts.outstanding.saturating_sub(1);
        drop(counts);
        self.shared.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_try_acquire_respects_bound() {
        let limiter = FrameLimiter::new(2);
        let a = limiter.try_acquire().unwrap();
        let _b = limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_none());
        assert_eq!(limiter.outstanding(), 2);

        drop(a);
        assert_eq!(limiter.outstanding(), 1);
        assert!(limiter.try_acquire().is_some());
        assert_eq!(limiter.peak(), 2);
        assert_eq!(limiter.acquired(), 3);
    }

    #[test]
    fn test_zero_bound_is_clamped() {
        let limiter = FrameLimiter::new(0);
        assert_eq!(limiter.max_in_flight(), 1);
        let _slot = limiter.acquire();
        assert!(limiter.try_acquire().is_none());
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let limiter = FrameLimiter::new(1);
        let slot = limiter.acquire();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(slot);
        });
        let _next = limiter.acquire();
        releaser.join().unwrap();
        assert_eq!(limiter.outstanding(), 1);
    }

    #[test]
    fn test_bound_holds_under_contention() {
        let limiter = FrameLimiter::new(3);
        let observed_max = Arc::new(AtomicUsize::new(0));
        let mut releasers = Vec::new();

        for _ in 0..50 {
            let slot = limiter.acquire();
            let outstanding = limiter.outstanding();
            observed_max.fetch_max(outstanding, Ordering::SeqCst);
            releasers.push(thread::spawn(move || {
                thread::sleep(Duration::from_millis(1));
                drop(slot);
            }));
        }
        for handle in releasers {
            handle.join().unwrap();
        }

        limiter.wait_idle();
        assert_eq!(limiter.outstanding(), 0);
        assert!(observed_max.load(Ordering::SeqCst) <= 3);
        assert!(limiter.peak() <= 3);
        assert_eq!(limiter.acquired(), 50);
    }
}
