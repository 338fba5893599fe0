//! # rtloop-timer
//!
//! Soft real-time software timers for Linux.
//!
//! Each timer is backed by its own `timerfd`. A single dispatcher thread,
//! optionally running under `SCHED_FIFO`/`SCHED_RR` with locked memory and a
//! pinned CPU, waits on all descriptors at once and invokes the callback of
//! every timer that expired.
//!
//! ## Architecture
//!
//! - [`bootstrap`] - dispatcher thread launch and the [`SchedulerBackend`] seam
//! - [`platform`] - the Linux scheduling backend
//! - [`registry`] - generational handles and the timer arena
//! - [`dispatcher`] - the wait/dispatch loop
//! - [`service`] - [`TimerService`] and [`TimerClient`]
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rtloop_timer::{TimerKind, TimerService};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut service = TimerService::initialize_standard()?;
//! let handle = service.arm_timer(2.0, TimerKind::Periodic, None, |handle, _data| {
//!     // Runs on the dispatcher thread every 2 ms.
//!     tracing::trace!(%handle, "tick");
//! })?;
//!
//! std::thread::sleep(std::time::Duration::from_millis(50));
//! service.stop_timer(handle);
//! service.teardown()?;
//! # Ok(())
//! # }
//! ```

#![deny(
    unsafe_op_in_unsafe_fn,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    missing_docs,
    missing_debug_implementations
)]
#![warn(clippy::pedantic)]

#[cfg(not(target_os = "linux"))]
compile_error!("rtloop-timer requires Linux (timerfd, sched_setaffinity)");

pub mod bootstrap;
pub mod config;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod platform;
pub mod prelude;
pub mod registry;
pub mod service;
pub mod stats;
pub mod time;

pub use bootstrap::{MemoryLockCount, SchedulerBackend};
pub use config::{
    ClockSource, DEFAULT_MAX_TIMERS, DEFAULT_POLL_TIMEOUT, DEFAULT_RT_PRIORITY,
    DEFAULT_THREAD_NAME, RealtimeConfig, SchedulingMode, SchedulingPolicy, ServiceConfig,
    ServiceConfigBuilder,
};
pub use descriptor::TimerFd;
pub use dispatcher::DispatcherState;
pub use error::{InitError, InitResult, TimerError, TimerResult};
pub use platform::LinuxBackend;
pub use registry::{TimerCallback, TimerEntry, TimerHandle, TimerKind, TimerRegistry, UserData};
pub use service::{TimerClient, TimerService};
pub use stats::{TimerCounters, TimerStats};
pub use time::{NANOS_PER_SEC, Timespec, duration_between, interval_from_millis};
