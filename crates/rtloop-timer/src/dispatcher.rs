//! The wait/dispatch loop run by the dispatcher thread.
//!
//! Each iteration checks the shutdown flag, snapshots the live descriptors
//! into a reused `pollfd` buffer, and waits in `poll(2)` for at most the
//! configured timeout. Ready descriptors are then dispatched in snapshot
//! order.
//!
//! # Callback execution
//!
//! Callbacks run synchronously on the dispatcher thread. A slow callback
//! delays every other timer that became due in the same iteration; callbacks
//! must therefore return quickly and must never block indefinitely.
//! Panics are not caught: under `panic = "abort"` they abort the process,
//! otherwise they end the dispatcher thread and surface from `teardown` as
//! `TimerError::DispatcherPanicked`.
//!
//! # Locking
//!
//! The registry lock guards the snapshot and each descriptor lookup, but is
//! released before a callback runs. The dispatch gate is held for the whole
//! dispatch phase and is also taken by `stop_timer`, so a client thread never
//! removes an entry while one of its callbacks is running. The gate is
//! re-entrant, which lets callbacks arm and stop timers themselves.

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use tracing::{info, trace, warn};

use crate::config::ServiceConfig;
use crate::registry::{TimerCallback, TimerHandle, TimerRegistry, UserData};
use crate::stats::TimerCounters;

/// Lifecycle of the dispatcher loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DispatcherState {
    /// Thread started, loop not entered yet.
    Idle = 0,
    /// Blocked in the readiness wait.
    Waiting = 1,
    /// Invoking callbacks of ready timers.
    Dispatching = 2,
    /// Loop exited after a shutdown request.
    Stopped = 3,
}

impl DispatcherState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Waiting,
            2 => Self::Dispatching,
            _ => Self::Stopped,
        }
    }
}

/// State shared between client threads and the dispatcher thread.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) registry: Mutex<TimerRegistry>,
    pub(crate) gate: ReentrantMutex<()>,
    pub(crate) counters: TimerCounters,
    pub(crate) config: ServiceConfig,
    shutdown: AtomicBool,
    state: AtomicU8,
}

impl Shared {
    pub(crate) fn new(config: ServiceConfig) -> Self {
        Self {
            registry: Mutex::new(TimerRegistry::with_capacity(config.max_timers)),
            gate: ReentrantMutex::new(()),
            counters: TimerCounters::new(),
            config,
            shutdown: AtomicBool::new(false),
            state: AtomicU8::new(DispatcherState::Idle as u8),
        }
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: DispatcherState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// The dispatch loop, moved onto the dispatcher thread by the bootstrap.
pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    poll_set: Vec<libc::pollfd>,
    timeout_ms: libc::c_int,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.shared.state())
            .field("polled", &self.poll_set.len())
            .field("timeout_ms", &self.timeout_ms)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let timeout_ms = shared.config.poll_timeout_ms();
        let poll_set = Vec::with_capacity(shared.config.max_timers);
        Self {
            shared,
            poll_set,
            timeout_ms,
        }
    }

    pub(crate) fn run(mut self) {
        info!(timeout_ms = self.timeout_ms, "dispatcher loop started");

        while !self.shared.is_shutdown() {
            self.shared.set_state(DispatcherState::Waiting);
            if self.wait() == 0 {
                self.shared.counters.inc_poll_timeout();
                continue;
            }

            self.shared.set_state(DispatcherState::Dispatching);
            self.dispatch_ready();
        }

        self.shared.set_state(DispatcherState::Stopped);
        info!("dispatcher loop stopped");
    }

    /// Snapshot the live descriptors and wait for readiness. Returns the
    /// number of ready descriptors; 0 on timeout or interruption.
    fn wait(&mut self) -> usize {
        self.shared.registry.lock().fill_poll_set(&mut self.poll_set);

        let nfds = libc::nfds_t::try_from(self.poll_set.len()).unwrap_or(libc::nfds_t::MAX);
        // SAFETY: `poll_set` holds `nfds` initialised pollfd values and is not
        // touched by anything else during the call.
        let rc = unsafe { libc::poll(self.poll_set.as_mut_ptr(), nfds, self.timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                warn!(error = %err, "poll on timer descriptors failed");
            }
            return 0;
        }
        usize::try_from(rc).unwrap_or(0)
    }

    fn dispatch_ready(&self) {
        let _gate = self.shared.gate.lock();

        for pfd in &self.poll_set {
            if pfd.revents & libc::POLLIN == 0 {
                continue;
            }
            let Some((handle, callback, user_data)) = self.claim_expiration(pfd.fd) else {
                continue;
            };

            trace!(%handle, "dispatching timer callback");
            callback(handle, user_data.as_ref());
            self.shared.counters.inc_dispatched();
        }
    }

    /// Consume the expiration of `fd` and clone out what is needed to invoke
    /// its owner's callback without holding the registry lock.
    fn claim_expiration(&self, fd: RawFd) -> Option<(TimerHandle, TimerCallback, Option<UserData>)> {
        let registry = self.shared.registry.lock();
        // The descriptor may have been stopped (and its number reused) since
        // the snapshot; the index only resolves live entries.
        let entry = registry.lookup_fd(fd)?;

        match entry.descriptor().read_expirations() {
            Ok(Some(count)) => self.shared.counters.add_expirations(count),
            Ok(None) => {
                self.shared.counters.inc_short_read();
                trace!(fd, "incomplete expiration read, skipping");
                return None;
            }
            Err(err) => {
                self.shared.counters.inc_short_read();
                trace!(fd, error = %err, "expiration read failed, skipping");
                return None;
            }
        }

        Some((
            entry.handle(),
            Arc::clone(entry.callback()),
            entry.user_data().cloned(),
        ))
    }
}
