//! Error types for the timer service.
//!
//! Bootstrap failures ([`InitError`]) are fatal to the caller: there is no
//! degraded mode and nothing of a failed bootstrap remains running.
//! Timer failures ([`TimerError`]) are recoverable and never leave a partial
//! entry behind in the registry.

use std::io;

use thiserror::Error;

use crate::config::SchedulingPolicy;

/// Errors raised while launching the dispatcher thread.
#[derive(Debug, Error)]
pub enum InitError {
    /// Locking the process address space into RAM failed.
    #[error("failed to lock process memory: {0}")]
    MemoryLock(#[source] io::Error),

    /// The requested scheduling policy could not be queried or applied.
    #[error("failed to apply {policy} scheduling policy: {source}")]
    SchedulingPolicy {
        /// Policy that was requested.
        policy: SchedulingPolicy,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The priority is outside the range the OS allows for the policy.
    #[error("priority {priority} is outside {min}..={max} for {policy}")]
    InvalidPriority {
        /// Policy that was requested.
        policy: SchedulingPolicy,
        /// Requested priority.
        priority: i32,
        /// Lowest priority accepted for the policy.
        min: i32,
        /// Highest priority accepted for the policy.
        max: i32,
    },

    /// Pinning the dispatcher thread to a CPU failed.
    #[error("failed to pin dispatcher thread to CPU {cpu}: {source}")]
    Affinity {
        /// CPU index that was requested.
        cpu: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The OS refused to create the dispatcher thread.
    #[error("failed to spawn dispatcher thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    /// The dispatcher thread exited before reporting its startup outcome.
    #[error("dispatcher thread exited during startup")]
    DispatcherExited,

    /// The service configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl InitError {
    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_configuration(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration(reason.into())
    }

    /// Create a scheduling policy error.
    #[must_use]
    pub fn scheduling_policy(policy: SchedulingPolicy, source: io::Error) -> Self {
        Self::SchedulingPolicy { policy, source }
    }

    /// Create an affinity error.
    #[must_use]
    pub fn affinity(cpu: usize, source: io::Error) -> Self {
        Self::Affinity { cpu, source }
    }
}

/// Errors raised by timer operations.
#[derive(Debug, Error)]
pub enum TimerError {
    /// `timerfd_create` failed.
    #[error("failed to create timer descriptor: {0}")]
    DescriptorCreate(#[source] io::Error),

    /// `timerfd_settime` failed.
    #[error("failed to arm timer descriptor: {0}")]
    DescriptorArm(#[source] io::Error),

    /// The interval is not a finite, positive number of milliseconds.
    #[error("invalid timer interval: {0} ms")]
    InvalidInterval(f64),

    /// The registry already holds its maximum number of timers.
    #[error("timer capacity of {0} exhausted")]
    CapacityExhausted(usize),

    /// The service has been torn down.
    #[error("timer service has been shut down")]
    ShutDown,

    /// The dispatcher thread panicked, most likely inside a callback.
    ///
    /// Only observable when panics unwind. The workspace profiles build with
    /// `panic = "abort"`, where a panicking callback aborts the whole process
    /// before `teardown` can report anything; test builds always unwind.
    #[error("dispatcher thread panicked")]
    DispatcherPanicked,
}

/// A specialized `Result` type for bootstrap operations.
pub type InitResult<T> = std::result::Result<T, InitError>;

/// A specialized `Result` type for timer operations.
pub type TimerResult<T> = std::result::Result<T, TimerError>;
