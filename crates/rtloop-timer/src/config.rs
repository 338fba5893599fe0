//! Service and scheduling configuration.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{InitError, InitResult};

/// Default bound on a single readiness wait of the dispatcher.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Default maximum number of simultaneously armed timers.
pub const DEFAULT_MAX_TIMERS: usize = 1000;

/// Default real-time priority (highest FIFO/RR priority on Linux).
pub const DEFAULT_RT_PRIORITY: i32 = 99;

/// Default name of the dispatcher thread.
pub const DEFAULT_THREAD_NAME: &str = "rtloop-dispatch";

const MIN_POLL_TIMEOUT: Duration = Duration::from_millis(1);
const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Clock backing the timer descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockSource {
    /// Monotonic clock, unaffected by wall-clock steps.
    #[default]
    Monotonic,
    /// Wall clock.
    Realtime,
}

/// OS scheduling class of the dispatcher thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    /// Fixed-priority first-in-first-out.
    #[default]
    Fifo,
    /// Fixed-priority round-robin.
    RoundRobin,
    /// Default time-sharing scheduling.
    Other,
}

impl SchedulingPolicy {
    /// Whether the policy is a fixed-priority real-time class.
    #[must_use]
    pub fn is_realtime(self) -> bool {
        matches!(self, Self::Fifo | Self::RoundRobin)
    }
}

impl fmt::Display for SchedulingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fifo => write!(f, "FIFO"),
            Self::RoundRobin => write!(f, "round-robin"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Real-time parameters applied to the dispatcher thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Scheduling policy.
    pub policy: SchedulingPolicy,
    /// Fixed priority within the policy. Ignored for [`SchedulingPolicy::Other`].
    pub priority: i32,
    /// CPU the dispatcher thread is pinned to.
    pub cpu: usize,
    /// Lock current and future pages of the process into RAM.
    pub lock_memory: bool,
}

impl RealtimeConfig {
    /// Create a configuration for `policy` pinned to `cpu` with the default
    /// priority and memory locking enabled.
    #[must_use]
    pub fn new(policy: SchedulingPolicy, cpu: usize) -> Self {
        Self {
            policy,
            priority: DEFAULT_RT_PRIORITY,
            cpu,
            lock_memory: true,
        }
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set memory locking.
    #[must_use]
    pub fn with_lock_memory(mut self, enabled: bool) -> Self {
        self.lock_memory = enabled;
        self
    }

    /// Priority that is actually requested from the OS.
    #[must_use]
    pub fn effective_priority(&self) -> i32 {
        if self.policy.is_realtime() {
            self.priority
        } else {
            0
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self::new(SchedulingPolicy::Fifo, 0)
    }
}

/// How the dispatcher thread is scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    /// Platform default policy, no explicit affinity.
    #[default]
    Standard,
    /// Locked memory, fixed policy/priority and CPU affinity.
    Realtime(RealtimeConfig),
}

/// Timer service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Upper bound on one readiness wait; also the shutdown latency bound.
    pub poll_timeout: Duration,
    /// Maximum number of simultaneously armed timers.
    pub max_timers: usize,
    /// Name given to the dispatcher thread.
    pub thread_name: String,
    /// Clock backing the timer descriptors.
    pub clock: ClockSource,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            max_timers: DEFAULT_MAX_TIMERS,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            clock: ClockSource::default(),
        }
    }
}

impl ServiceConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`InitError::InvalidConfiguration`] if any value is out of range.
    pub fn validate(&self) -> InitResult<()> {
        if self.poll_timeout < MIN_POLL_TIMEOUT || self.poll_timeout > MAX_POLL_TIMEOUT {
            return Err(InitError::invalid_configuration(format!(
                "poll_timeout must be within {MIN_POLL_TIMEOUT:?}..={MAX_POLL_TIMEOUT:?}, got {:?}",
                self.poll_timeout
            )));
        }
        if self.max_timers == 0 {
            return Err(InitError::invalid_configuration(
                "max_timers must be greater than 0",
            ));
        }
        if self.thread_name.is_empty() || self.thread_name.contains('\0') {
            return Err(InitError::invalid_configuration(
                "thread_name must be non-empty and free of NUL bytes",
            ));
        }
        Ok(())
    }

    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    /// Poll timeout in whole milliseconds, as expected by `poll(2)`.
    pub(crate) fn poll_timeout_ms(&self) -> libc::c_int {
        libc::c_int::try_from(self.poll_timeout.as_millis()).unwrap_or(libc::c_int::MAX)
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug, Default)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    /// Set the poll timeout.
    #[must_use]
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout = timeout;
        self
    }

    /// Set the timer capacity.
    #[must_use]
    pub fn max_timers(mut self, max: usize) -> Self {
        self.config.max_timers = max;
        self
    }

    /// Set the dispatcher thread name.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Set the descriptor clock.
    #[must_use]
    pub fn clock(mut self, clock: ClockSource) -> Self {
        self.config.clock = clock;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> InitResult<ServiceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
