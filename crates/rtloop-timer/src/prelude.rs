//! Prelude for rtloop-timer.
//!
//! ```rust
//! use rtloop_timer::prelude::*;
//!
//! let config = RealtimeConfig::new(SchedulingPolicy::Fifo, 1).with_priority(80);
//! assert_eq!(config.effective_priority(), 80);
//! ```

pub use crate::config::{
    ClockSource, RealtimeConfig, SchedulingMode, SchedulingPolicy, ServiceConfig,
};
pub use crate::error::{InitError, TimerError};
pub use crate::registry::{TimerHandle, TimerKind, UserData};
pub use crate::service::{TimerClient, TimerService};
pub use crate::stats::TimerStats;
pub use crate::time::{Timespec, duration_between};
