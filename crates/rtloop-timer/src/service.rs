//! Public façade: service lifetime and timer operations.
//!
//! A [`TimerService`] owns the dispatcher thread. [`TimerClient`] is a cheap,
//! cloneable view used to arm and stop timers from any thread, including
//! from inside callbacks.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::bootstrap::{MemoryLease, SchedulerBackend, spawn_dispatcher};
use crate::config::{RealtimeConfig, SchedulingMode, ServiceConfig};
use crate::descriptor::TimerFd;
use crate::dispatcher::{Dispatcher, DispatcherState, Shared};
use crate::error::{InitResult, TimerError, TimerResult};
use crate::platform::LinuxBackend;
use crate::registry::{TimerCallback, TimerHandle, TimerKind, UserData};
use crate::stats::TimerStats;
use crate::time::interval_from_millis;

/// Handle for arming and stopping timers on a running service.
#[derive(Clone)]
pub struct TimerClient {
    shared: Arc<Shared>,
}

impl fmt::Debug for TimerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerClient")
            .field("live_timers", &self.live_timers())
            .field("state", &self.dispatcher_state())
            .finish_non_exhaustive()
    }
}

impl TimerClient {
    /// Create and register a timer that expires every `interval_ms`
    /// milliseconds (or once, for [`TimerKind::SingleShot`]).
    ///
    /// `callback` runs on the dispatcher thread with the new handle and
    /// `user_data`. It must return quickly.
    ///
    /// # Errors
    ///
    /// - [`TimerError::InvalidInterval`] if `interval_ms` is not a finite,
    ///   positive number
    /// - [`TimerError::CapacityExhausted`] if the registry is full
    /// - [`TimerError::DescriptorCreate`] / [`TimerError::DescriptorArm`] if
    ///   the OS timer cannot be set up
    /// - [`TimerError::ShutDown`] after teardown
    ///
    /// On error nothing is registered and no descriptor is left open.
    pub fn arm_timer<F>(
        &self,
        interval_ms: f64,
        kind: TimerKind,
        user_data: Option<UserData>,
        callback: F,
    ) -> TimerResult<TimerHandle>
    where
        F: Fn(TimerHandle, Option<&UserData>) + Send + Sync + 'static,
    {
        self.try_arm(interval_ms, kind, user_data, Arc::new(callback))
            .inspect(|handle| {
                self.shared.counters.inc_armed();
                debug!(%handle, interval_ms, ?kind, "timer armed");
            })
            .inspect_err(|err| {
                self.shared.counters.inc_arm_failure();
                debug!(error = %err, interval_ms, ?kind, "failed to arm timer");
            })
    }

    fn try_arm(
        &self,
        interval_ms: f64,
        kind: TimerKind,
        user_data: Option<UserData>,
        callback: TimerCallback,
    ) -> TimerResult<TimerHandle> {
        let interval = interval_from_millis(interval_ms)?;

        // Descriptors are created and closed under the registry lock only.
        let mut registry = self.shared.registry.lock();
        if self.shared.is_shutdown() {
            return Err(TimerError::ShutDown);
        }
        if registry.is_full() {
            return Err(TimerError::CapacityExhausted(registry.capacity()));
        }

        let descriptor =
            TimerFd::new(self.shared.config.clock).map_err(TimerError::DescriptorCreate)?;
        descriptor
            .arm(interval, kind)
            .map_err(TimerError::DescriptorArm)?;
        registry.insert(descriptor, kind, interval_ms, callback, user_data)
    }

    /// Stop and remove the timer identified by `handle`.
    ///
    /// Unknown or already stopped handles are ignored. When called from a
    /// thread other than the dispatcher, this waits for any in-flight
    /// callback to return, so the timer's callback never runs after
    /// `stop_timer` returns.
    pub fn stop_timer(&self, handle: TimerHandle) {
        let _gate = self.shared.gate.lock();
        let mut registry = self.shared.registry.lock();

        let Some(entry) = registry.remove(handle) else {
            drop(registry);
            debug!(%handle, "stop requested for unknown timer");
            return;
        };
        let (interval_ms, kind) = (entry.interval_ms(), entry.kind());
        drop(entry);
        drop(registry);

        self.shared.counters.add_stopped(1);
        debug!(%handle, interval_ms, ?kind, "timer stopped");
    }

    /// Whether `handle` refers to a registered timer.
    #[must_use]
    pub fn contains(&self, handle: TimerHandle) -> bool {
        self.shared.registry.lock().contains(handle)
    }

    /// Number of registered timers.
    #[must_use]
    pub fn live_timers(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Snapshot of the service counters.
    #[must_use]
    pub fn stats(&self) -> TimerStats {
        let live = self.live_timers();
        self.shared.counters.snapshot(live)
    }

    /// Current phase of the dispatcher loop.
    #[must_use]
    pub fn dispatcher_state(&self) -> DispatcherState {
        self.shared.state()
    }

    /// Whether the service has been torn down.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Remove every timer and flag the dispatcher to stop. Returns the number
    /// of timers removed.
    fn drain_and_shutdown(&self) -> usize {
        let _gate = self.shared.gate.lock();
        let mut registry = self.shared.registry.lock();
        let drained = registry.drain();
        let count = drained.len();
        drop(drained);
        self.shared.request_shutdown();
        drop(registry);

        self.shared
            .counters
            .add_stopped(u64::try_from(count).unwrap_or(u64::MAX));
        count
    }
}

/// A running timer service: registry plus dispatcher thread.
///
/// Dropping the service tears it down.
pub struct TimerService {
    client: TimerClient,
    thread: Option<JoinHandle<()>>,
    affinity: Vec<usize>,
    mode: SchedulingMode,
    memory: Option<MemoryLease>,
}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerService")
            .field("mode", &self.mode)
            .field("affinity", &self.affinity)
            .field("running", &self.thread.is_some())
            .field("memory_locked", &self.memory.is_some())
            .field("client", &self.client)
            .finish()
    }
}

impl TimerService {
    /// Start a service whose dispatcher runs under a real-time policy,
    /// pinned to `config.cpu`, with process memory locked.
    ///
    /// # Errors
    ///
    /// Returns an [`InitError`](crate::InitError) naming the step that
    /// failed. Nothing is left running, and memory locked by this call is
    /// unlocked again unless another service still holds the lock.
    pub fn initialize_realtime(config: RealtimeConfig) -> InitResult<Self> {
        Self::start(ServiceConfig::default(), SchedulingMode::Realtime(config))
    }

    /// Start a service whose dispatcher uses the default OS scheduling.
    ///
    /// # Errors
    ///
    /// Returns [`InitError::ThreadSpawn`](crate::InitError::ThreadSpawn) if
    /// the dispatcher thread cannot be created.
    pub fn initialize_standard() -> InitResult<Self> {
        Self::start(ServiceConfig::default(), SchedulingMode::Standard)
    }

    /// Start a service with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns an [`InitError`](crate::InitError) if the configuration is
    /// invalid or any bootstrap step fails.
    pub fn start(config: ServiceConfig, mode: SchedulingMode) -> InitResult<Self> {
        Self::start_with_backend(config, mode, Arc::new(LinuxBackend::new()))
    }

    /// Start a service using `backend` for memory locking and thread
    /// scheduling.
    ///
    /// # Errors
    ///
    /// Returns an [`InitError`](crate::InitError) if the configuration is
    /// invalid or any bootstrap step fails.
    pub fn start_with_backend(
        config: ServiceConfig,
        mode: SchedulingMode,
        backend: Arc<dyn SchedulerBackend>,
    ) -> InitResult<Self> {
        config.validate()?;

        let thread_name = config.thread_name.clone();
        let shared = Arc::new(Shared::new(config));
        let dispatcher = Dispatcher::new(Arc::clone(&shared));
        let spawned = spawn_dispatcher(&thread_name, &mode, backend, dispatcher)?;

        Ok(Self {
            client: TimerClient { shared },
            thread: Some(spawned.handle),
            affinity: spawned.affinity,
            mode,
            memory: spawned.memory,
        })
    }

    /// A cloneable client for this service.
    #[must_use]
    pub fn client(&self) -> TimerClient {
        self.client.clone()
    }

    /// See [`TimerClient::arm_timer`].
    ///
    /// # Errors
    ///
    /// See [`TimerClient::arm_timer`].
    pub fn arm_timer<F>(
        &self,
        interval_ms: f64,
        kind: TimerKind,
        user_data: Option<UserData>,
        callback: F,
    ) -> TimerResult<TimerHandle>
    where
        F: Fn(TimerHandle, Option<&UserData>) + Send + Sync + 'static,
    {
        self.client.arm_timer(interval_ms, kind, user_data, callback)
    }

    /// See [`TimerClient::stop_timer`].
    pub fn stop_timer(&self, handle: TimerHandle) {
        self.client.stop_timer(handle);
    }

    /// Number of registered timers.
    #[must_use]
    pub fn live_timers(&self) -> usize {
        self.client.live_timers()
    }

    /// Snapshot of the service counters.
    #[must_use]
    pub fn stats(&self) -> TimerStats {
        self.client.stats()
    }

    /// Current phase of the dispatcher loop.
    #[must_use]
    pub fn dispatcher_state(&self) -> DispatcherState {
        self.client.dispatcher_state()
    }

    /// CPUs the dispatcher thread may run on, as read after bootstrap.
    /// Empty if the mask could not be read.
    #[must_use]
    pub fn dispatcher_affinity(&self) -> &[usize] {
        &self.affinity
    }

    /// Scheduling mode the service was started with.
    #[must_use]
    pub fn mode(&self) -> &SchedulingMode {
        &self.mode
    }

    /// Remove all timers, stop the dispatcher and wait for it to exit.
    ///
    /// The dispatcher notices the request within one poll timeout. Once it
    /// has exited, the service gives back its hold on the process memory
    /// lock; memory is unlocked when no other service holds it. When called
    /// from a callback, the dispatcher is flagged but not joined, and the
    /// hold is given back when the service is dropped. Calling `teardown`
    /// again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::DispatcherPanicked`] if the dispatcher thread
    /// panicked, most likely inside a callback. With `panic = "abort"` a
    /// panicking callback aborts the process instead.
    pub fn teardown(&mut self) -> TimerResult<()> {
        let Some(handle) = self.thread.take() else {
            return Ok(());
        };

        let started = Instant::now();
        let drained = self.client.drain_and_shutdown();

        if handle.thread().id() == thread::current().id() {
            debug!(drained, "teardown requested from the dispatcher thread");
            return Ok(());
        }

        let joined = handle.join();
        drop(self.memory.take());
        if joined.is_err() {
            error!(drained, "dispatcher thread panicked");
            return Err(TimerError::DispatcherPanicked);
        }

        let stats = self.client.stats();
        info!(
            drained,
            armed = stats.timers_armed,
            expirations = stats.expirations,
            callbacks = stats.callbacks_dispatched,
            elapsed_ms = started.elapsed().as_millis(),
            "timer service torn down"
        );
        Ok(())
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        if self.thread.is_some()
            && let Err(err) = self.teardown()
        {
            warn!(error = %err, "teardown on drop failed");
        }
    }
}
