//! Atomic counters describing timer service activity.
//!
//! Counters are bumped from client threads (arm/stop) and from the dispatcher
//! thread (expirations, callbacks). All updates use `Ordering::Relaxed`; the
//! values are statistics, not synchronisation.

use core::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time copy of the service counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimerStats {
    /// Timers successfully armed.
    pub timers_armed: u64,
    /// Timers removed by `stop_timer` or teardown.
    pub timers_stopped: u64,
    /// `arm_timer` calls that failed.
    pub arm_failures: u64,
    /// Expirations consumed from timer descriptors.
    pub expirations: u64,
    /// Callbacks invoked.
    pub callbacks_dispatched: u64,
    /// Ready descriptors whose expiration counter could not be read in full.
    pub short_reads: u64,
    /// Readiness waits that ended without any ready descriptor.
    pub poll_timeouts: u64,
    /// Entries currently registered.
    pub live_timers: u64,
}

impl TimerStats {
    /// Expirations that were coalesced into an earlier callback because the
    /// dispatcher fell behind.
    #[must_use]
    pub fn overruns(&self) -> u64 {
        self.expirations.saturating_sub(self.callbacks_dispatched)
    }
}

/// Lock-free counters shared by clients and the dispatcher.
#[derive(Debug, Default)]
pub struct TimerCounters {
    timers_armed: AtomicU64,
    timers_stopped: AtomicU64,
    arm_failures: AtomicU64,
    expirations: AtomicU64,
    callbacks_dispatched: AtomicU64,
    short_reads: AtomicU64,
    poll_timeouts: AtomicU64,
}

impl TimerCounters {
    /// Create zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            timers_armed: AtomicU64::new(0),
            timers_stopped: AtomicU64::new(0),
            arm_failures: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            callbacks_dispatched: AtomicU64::new(0),
            short_reads: AtomicU64::new(0),
            poll_timeouts: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn inc_armed(&self) {
        self.timers_armed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_stopped(&self, count: u64) {
        self.timers_stopped.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_arm_failure(&self) {
        self.arm_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_expirations(&self, count: u64) {
        self.expirations.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_dispatched(&self) {
        self.callbacks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_short_read(&self) {
        self.short_reads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_poll_timeout(&self) {
        self.poll_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy all counters. `live_timers` is supplied by the caller because it
    /// lives in the registry, not here.
    #[must_use]
    pub fn snapshot(&self, live_timers: usize) -> TimerStats {
        TimerStats {
            timers_armed: self.timers_armed.load(Ordering::Relaxed),
            timers_stopped: self.timers_stopped.load(Ordering::Relaxed),
            arm_failures: self.arm_failures.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            callbacks_dispatched: self.callbacks_dispatched.load(Ordering::Relaxed),
            short_reads: self.short_reads.load(Ordering::Relaxed),
            poll_timeouts: self.poll_timeouts.load(Ordering::Relaxed),
            live_timers: u64::try_from(live_timers).unwrap_or(u64::MAX),
        }
    }
}
