//! Linux `timerfd` descriptors.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::config::ClockSource;
use crate::registry::TimerKind;
use crate::time::Timespec;

/// An owned, non-blocking timer descriptor. Closed on drop.
#[derive(Debug)]
pub struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    /// Create a disarmed timer descriptor on `clock`.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `timerfd_create`.
    pub fn new(clock: ClockSource) -> io::Result<Self> {
        let clock_id = match clock {
            ClockSource::Monotonic => libc::CLOCK_MONOTONIC,
            ClockSource::Realtime => libc::CLOCK_REALTIME,
        };

        // SAFETY: timerfd_create takes no pointers; the result is checked below.
        let raw = unsafe { libc::timerfd_create(clock_id, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: `raw` is a freshly created descriptor that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self { fd })
    }

    /// Arm the descriptor to expire after `interval`, and then every
    /// `interval` for [`TimerKind::Periodic`].
    ///
    /// # Errors
    ///
    /// Returns the OS error from `timerfd_settime`.
    pub fn arm(&self, interval: Timespec, kind: TimerKind) -> io::Result<()> {
        let value = interval.to_libc();
        let repeat = match kind {
            TimerKind::Periodic => value,
            TimerKind::SingleShot => libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        };
        let spec = libc::itimerspec {
            it_interval: repeat,
            it_value: value,
        };

        // SAFETY: `spec` outlives the call and a null old-value pointer is allowed.
        let rc = unsafe { libc::timerfd_settime(self.fd.as_raw_fd(), 0, &spec, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Consume the pending expiration count.
    ///
    /// Returns `Ok(None)` when nothing could be consumed: no expiration is
    /// pending, the read was interrupted, or fewer than eight bytes arrived.
    ///
    /// # Errors
    ///
    /// Returns any other OS error from `read`.
    pub fn read_expirations(&self) -> io::Result<Option<u64>> {
        let mut buf = [0u8; 8];

        // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
        let n = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
                _ => Err(err),
            };
        }

        if usize::try_from(n).ok() != Some(buf.len()) {
            return Ok(None);
        }
        Ok(Some(u64::from_ne_bytes(buf)))
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
