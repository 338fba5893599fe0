//! Second/nanosecond time values and interval conversion.

use std::io;
use std::time::Duration;

use crate::config::ClockSource;
use crate::error::{TimerError, TimerResult};

/// Nanoseconds in one second.
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

const NANOS_PER_MILLI: f64 = 1_000_000.0;

/// A point in time or an elapsed time, split into seconds and nanoseconds.
///
/// Normalised values keep `nsec` within `0..NANOS_PER_SEC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timespec {
    /// Whole seconds.
    pub sec: i64,
    /// Sub-second part in nanoseconds.
    pub nsec: i64,
}

impl Timespec {
    /// Zero seconds.
    pub const ZERO: Self = Self { sec: 0, nsec: 0 };

    /// Create a value from seconds and nanoseconds.
    #[must_use]
    pub const fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    /// Read the given clock.
    ///
    /// # Errors
    ///
    /// Returns the OS error if `clock_gettime` fails.
    pub fn now(clock: ClockSource) -> io::Result<Self> {
        let clock_id = match clock {
            ClockSource::Monotonic => libc::CLOCK_MONOTONIC,
            ClockSource::Realtime => libc::CLOCK_REALTIME,
        };
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
        let rc = unsafe { libc::clock_gettime(clock_id, &mut ts) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self::from(ts))
    }

    /// Read the monotonic clock.
    ///
    /// # Errors
    ///
    /// Returns the OS error if `clock_gettime` fails.
    pub fn now_monotonic() -> io::Result<Self> {
        Self::now(ClockSource::Monotonic)
    }

    /// Total value in (fractional) milliseconds.
    #[must_use]
    pub fn as_millis_f64(&self) -> f64 {
        self.sec as f64 * 1_000.0 + self.nsec as f64 / NANOS_PER_MILLI
    }

    /// Convert to a [`Duration`], or `None` for negative values.
    #[must_use]
    pub fn to_duration(self) -> Option<Duration> {
        let sec = u64::try_from(self.sec).ok()?;
        let nsec = u32::try_from(self.nsec).ok()?;
        Some(Duration::new(sec, nsec))
    }

    pub(crate) fn to_libc(self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.sec as libc::time_t,
            tv_nsec: self.nsec as libc::c_long,
        }
    }
}

impl From<libc::timespec> for Timespec {
    fn from(ts: libc::timespec) -> Self {
        Self {
            sec: i64::from(ts.tv_sec),
            nsec: i64::from(ts.tv_nsec),
        }
    }
}

impl From<Duration> for Timespec {
    fn from(duration: Duration) -> Self {
        Self {
            sec: i64::try_from(duration.as_secs()).unwrap_or(i64::MAX),
            nsec: i64::from(duration.subsec_nanos()),
        }
    }
}

/// Elapsed time from `start` to `end`.
///
/// When the nanosecond part of `end` is smaller than that of `start`, one
/// whole second is borrowed from the seconds part. Every step saturates, so
/// non-normalised inputs clamp instead of overflowing.
///
/// ```
/// use rtloop_timer::{Timespec, duration_between};
///
/// let elapsed = duration_between(
///     Timespec::new(5, 200_000_000),
///     Timespec::new(6, 100_000_000),
/// );
/// assert_eq!(elapsed, Timespec::new(0, 900_000_000));
/// ```
#[must_use]
pub fn duration_between(start: Timespec, end: Timespec) -> Timespec {
    if end.nsec < start.nsec {
        Timespec {
            sec: end.sec.saturating_sub(start.sec).saturating_sub(1),
            nsec: NANOS_PER_SEC
                .saturating_add(end.nsec)
                .saturating_sub(start.nsec),
        }
    } else {
        Timespec {
            sec: end.sec.saturating_sub(start.sec),
            nsec: end.nsec.saturating_sub(start.nsec),
        }
    }
}

/// Convert a millisecond interval into a normalised [`Timespec`].
///
/// Intervals below one nanosecond are rounded up to one nanosecond, because a
/// zero value would disarm the timer descriptor instead of arming it.
///
/// # Errors
///
/// Returns [`TimerError::InvalidInterval`] for non-finite, zero, negative or
/// unrepresentably large intervals.
pub fn interval_from_millis(interval_ms: f64) -> TimerResult<Timespec> {
    if !interval_ms.is_finite() || interval_ms <= 0.0 {
        return Err(TimerError::InvalidInterval(interval_ms));
    }

    let total_ns = (interval_ms * NANOS_PER_MILLI).round();
    if total_ns >= i64::MAX as f64 {
        return Err(TimerError::InvalidInterval(interval_ms));
    }

    let total_ns = (total_ns as i64).max(1);
    Ok(Timespec {
        sec: total_ns / NANOS_PER_SEC,
        nsec: total_ns % NANOS_PER_SEC,
    })
}
