//! Dispatcher thread bootstrap.
//!
//! Launching the dispatcher is a handshake: memory is locked on the calling
//! thread, the new thread applies its own policy, priority and CPU affinity,
//! and reports the outcome over a channel before it enters the dispatch loop.
//! The caller blocks on that report, so every failure is returned
//! synchronously and a failed bootstrap leaves no running thread behind.
//!
//! # Memory locking
//!
//! `mlockall` and `munlockall` act on the whole process, while several
//! services may run side by side. Each real-time service therefore holds a
//! [`MemoryLease`]: the first lease locks memory, the last one to be released
//! unlocks it, and a failed bootstrap only gives back the lease it took.

use std::fmt;
use std::io;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{RealtimeConfig, SchedulingMode, SchedulingPolicy};
use crate::dispatcher::Dispatcher;
use crate::error::{InitError, InitResult};

/// OS primitives needed to configure the dispatcher thread.
///
/// `apply_policy`, `pin_to_cpu` and `current_affinity` act on the calling
/// thread; the bootstrap invokes them from the dispatcher thread itself.
pub trait SchedulerBackend: Send + Sync + fmt::Debug {
    /// Lock current and future pages of the process into RAM.
    ///
    /// Only called by the first holder of [`SchedulerBackend::memory_locks`].
    ///
    /// # Errors
    ///
    /// Returns the OS error if the pages cannot be locked.
    fn lock_memory(&self) -> io::Result<()>;

    /// Undo [`SchedulerBackend::lock_memory`].
    ///
    /// Only called once the last holder has released its lease.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the pages cannot be unlocked.
    fn unlock_memory(&self) -> io::Result<()>;

    /// Holder count for the memory lock this backend manages. Every backend
    /// acting on the same process must return the same count.
    fn memory_locks(&self) -> &MemoryLockCount;

    /// Priorities accepted for `policy`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the policy is unknown.
    fn priority_range(&self, policy: SchedulingPolicy) -> io::Result<RangeInclusive<i32>>;

    /// Switch the calling thread to `policy` at `priority`.
    ///
    /// # Errors
    ///
    /// Returns the OS error, typically `EPERM` without real-time privileges.
    fn apply_policy(&self, policy: SchedulingPolicy, priority: i32) -> io::Result<()>;

    /// Restrict the calling thread to `cpu`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the CPU does not exist or is not allowed.
    fn pin_to_cpu(&self, cpu: usize) -> io::Result<()>;

    /// CPUs the calling thread may run on.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the mask cannot be read.
    fn current_affinity(&self) -> io::Result<Vec<usize>>;
}

/// Number of live holders of a process-wide memory lock.
#[derive(Debug, Default)]
pub struct MemoryLockCount {
    holders: Mutex<usize>,
}

impl MemoryLockCount {
    /// A count with no holders.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            holders: parking_lot::const_mutex(0),
        }
    }

    /// Services currently holding the lock.
    #[must_use]
    pub fn holders(&self) -> usize {
        *self.holders.lock()
    }
}

/// One service's hold on the process memory lock, given back on drop.
#[derive(Debug)]
pub(crate) struct MemoryLease {
    backend: Arc<dyn SchedulerBackend>,
}

impl MemoryLease {
    fn acquire(backend: &Arc<dyn SchedulerBackend>) -> io::Result<Self> {
        let mut holders = backend.memory_locks().holders.lock();
        if *holders == 0 {
            backend.lock_memory()?;
        }
        *holders = holders.saturating_add(1);
        debug!(holders = *holders, "memory lock acquired");
        drop(holders);

        Ok(Self {
            backend: Arc::clone(backend),
        })
    }
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        let mut holders = self.backend.memory_locks().holders.lock();
        *holders = holders.saturating_sub(1);
        if *holders > 0 {
            debug!(holders = *holders, "memory lock still held by other services");
            return;
        }
        match self.backend.unlock_memory() {
            Ok(()) => debug!("memory unlocked"),
            Err(err) => warn!(error = %err, "munlockall failed"),
        }
    }
}

/// A running dispatcher thread together with its resolved affinity.
#[derive(Debug)]
pub(crate) struct DispatcherThread {
    pub(crate) handle: JoinHandle<()>,
    pub(crate) affinity: Vec<usize>,
    pub(crate) memory: Option<MemoryLease>,
}

/// Launch `dispatcher` on a new thread scheduled according to `mode`.
pub(crate) fn spawn_dispatcher(
    thread_name: &str,
    mode: &SchedulingMode,
    backend: Arc<dyn SchedulerBackend>,
    dispatcher: Dispatcher,
) -> InitResult<DispatcherThread> {
    let realtime = match mode {
        SchedulingMode::Standard => None,
        SchedulingMode::Realtime(config) => Some(resolve_priority(backend.as_ref(), config)?),
    };

    let memory = match &realtime {
        Some(config) if config.lock_memory => {
            Some(MemoryLease::acquire(&backend).map_err(|err| {
                error!(error = %err, "mlockall failed");
                InitError::MemoryLock(err)
            })?)
        }
        _ => None,
    };

    // On failure `memory` is dropped here, releasing only this start's lease.
    let (handle, affinity) = launch(thread_name, realtime, backend, dispatcher)
        .inspect_err(|err| error!(error = %err, "dispatcher bootstrap failed"))?;

    Ok(DispatcherThread {
        handle,
        affinity,
        memory,
    })
}

fn resolve_priority(
    backend: &dyn SchedulerBackend,
    config: &RealtimeConfig,
) -> InitResult<RealtimeConfig> {
    let priority = config.effective_priority();
    let range = backend
        .priority_range(config.policy)
        .map_err(|source| InitError::scheduling_policy(config.policy, source))?;

    if !range.contains(&priority) {
        return Err(InitError::InvalidPriority {
            policy: config.policy,
            priority,
            min: *range.start(),
            max: *range.end(),
        });
    }

    Ok(RealtimeConfig {
        priority,
        ..config.clone()
    })
}

fn launch(
    thread_name: &str,
    realtime: Option<RealtimeConfig>,
    backend: Arc<dyn SchedulerBackend>,
    dispatcher: Dispatcher,
) -> InitResult<(JoinHandle<()>, Vec<usize>)> {
    let (ready_tx, ready_rx) = channel::bounded::<InitResult<Vec<usize>>>(1);

    let handle = thread::Builder::new()
        .name(thread_name.to_string())
        .spawn(move || {
            let outcome = configure_current_thread(backend.as_ref(), realtime.as_ref());
            let configured = outcome.is_ok();
            if ready_tx.send(outcome).is_err() || !configured {
                return;
            }
            dispatcher.run();
        })
        .map_err(InitError::ThreadSpawn)?;

    match ready_rx.recv() {
        Ok(Ok(affinity)) => Ok((handle, affinity)),
        Ok(Err(err)) => {
            join_failed(handle);
            Err(err)
        }
        Err(_disconnected) => {
            join_failed(handle);
            Err(InitError::DispatcherExited)
        }
    }
}

fn configure_current_thread(
    backend: &dyn SchedulerBackend,
    realtime: Option<&RealtimeConfig>,
) -> InitResult<Vec<usize>> {
    if let Some(config) = realtime {
        backend
            .apply_policy(config.policy, config.priority)
            .map_err(|source| InitError::scheduling_policy(config.policy, source))?;
        backend
            .pin_to_cpu(config.cpu)
            .map_err(|source| InitError::affinity(config.cpu, source))?;
    }

    let affinity = match backend.current_affinity() {
        Ok(cpus) => cpus,
        Err(err) => {
            warn!(error = %err, "could not read dispatcher CPU affinity");
            Vec::new()
        }
    };

    match realtime {
        Some(config) => info!(
            policy = %config.policy,
            priority = config.priority,
            cpu = config.cpu,
            cpus = ?affinity,
            "real-time dispatcher configured"
        ),
        None => info!(cpus = ?affinity, "standard dispatcher configured"),
    }

    Ok(affinity)
}

fn join_failed(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        error!("dispatcher thread panicked during startup");
    }
}
