//! Linux-specific scheduling backend.

use std::io;
use std::mem;
use std::ops::RangeInclusive;

use crate::bootstrap::{MemoryLockCount, SchedulerBackend};
use crate::config::SchedulingPolicy;

const CPU_SETSIZE: usize = libc::CPU_SETSIZE as usize;

/// `mlockall` state is per process, so every `LinuxBackend` shares one count.
static PROCESS_MEMORY_LOCKS: MemoryLockCount = MemoryLockCount::new();

/// Scheduling backend built on `mlockall`, `pthread_setschedparam` and
/// `sched_setaffinity`.
///
/// Real-time policies need `CAP_SYS_NICE` (or an `RLIMIT_RTPRIO` budget) and
/// memory locking needs `CAP_IPC_LOCK` (or a sufficient `RLIMIT_MEMLOCK`).
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxBackend;

impl LinuxBackend {
    /// Create the backend.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn raw_policy(policy: SchedulingPolicy) -> libc::c_int {
    match policy {
        SchedulingPolicy::Fifo => libc::SCHED_FIFO,
        SchedulingPolicy::RoundRobin => libc::SCHED_RR,
        SchedulingPolicy::Other => libc::SCHED_OTHER,
    }
}

fn empty_cpu_set() -> libc::cpu_set_t {
    // SAFETY: cpu_set_t is a plain bitmask; all-zero bytes is the empty set.
    unsafe { mem::zeroed() }
}

impl SchedulerBackend for LinuxBackend {
    fn lock_memory(&self) -> io::Result<()> {
        // SAFETY: mlockall only takes flags.
        let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn unlock_memory(&self) -> io::Result<()> {
        // SAFETY: munlockall takes no arguments.
        let rc = unsafe { libc::munlockall() };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn memory_locks(&self) -> &MemoryLockCount {
        &PROCESS_MEMORY_LOCKS
    }

    fn priority_range(&self, policy: SchedulingPolicy) -> io::Result<RangeInclusive<i32>> {
        let raw = raw_policy(policy);

        // SAFETY: takes a policy constant only.
        let min = unsafe { libc::sched_get_priority_min(raw) };
        if min == -1 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: takes a policy constant only.
        let max = unsafe { libc::sched_get_priority_max(raw) };
        if max == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(min..=max)
    }

    fn apply_policy(&self, policy: SchedulingPolicy, priority: i32) -> io::Result<()> {
        let param = libc::sched_param {
            sched_priority: priority,
        };

        // SAFETY: pthread_self has no preconditions.
        let thread = unsafe { libc::pthread_self() };

        // SAFETY: `thread` is the calling thread and `param` outlives the call.
        let rc = unsafe { libc::pthread_setschedparam(thread, raw_policy(policy), &param) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }

    fn pin_to_cpu(&self, cpu: usize) -> io::Result<()> {
        if cpu >= CPU_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("CPU index {cpu} exceeds CPU_SETSIZE ({CPU_SETSIZE})"),
            ));
        }

        let mut set = empty_cpu_set();
        // SAFETY: `cpu` is below CPU_SETSIZE, so the bit lies inside `set`.
        unsafe { libc::CPU_SET(cpu, &mut set) };

        // SAFETY: `set` is a valid cpu_set_t of the given size; pid 0 is the calling thread.
        let rc = unsafe { libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn current_affinity(&self) -> io::Result<Vec<usize>> {
        let mut set = empty_cpu_set();

        // SAFETY: `set` is a valid, writable cpu_set_t of the given size.
        let rc = unsafe { libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut set) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok((0..CPU_SETSIZE)
            .filter(|&cpu| {
                // SAFETY: `cpu` is below CPU_SETSIZE.
                unsafe { libc::CPU_ISSET(cpu, &set) }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_fifo_priority_range() -> TestResult {
        let range = LinuxBackend::new().priority_range(SchedulingPolicy::Fifo)?;
        assert_eq!(range, 1..=99);

        let other = LinuxBackend::new().priority_range(SchedulingPolicy::Other)?;
        assert_eq!(other, 0..=0);
        Ok(())
    }

    #[test]
    fn test_current_affinity_is_not_empty() -> TestResult {
        let cpus = LinuxBackend::new().current_affinity()?;
        assert!(!cpus.is_empty());
        Ok(())
    }

    #[test]
    fn test_pin_to_allowed_cpu() -> TestResult {
        let backend = LinuxBackend::new();
        let target = *backend
            .current_affinity()?
            .first()
            .ok_or("no CPU in affinity mask")?;

        let pinned = thread::spawn(move || -> io::Result<Vec<usize>> {
            backend.pin_to_cpu(target)?;
            backend.current_affinity()
        })
        .join()
        .map_err(|_panic| "pinning thread panicked")??;

        assert_eq!(pinned, vec![target]);
        Ok(())
    }

    #[test]
    fn test_backends_share_the_process_lock_count() {
        let first = LinuxBackend::new();
        let second = LinuxBackend::new();
        assert!(std::ptr::eq(first.memory_locks(), second.memory_locks()));
    }

    #[test]
    fn test_pin_rejects_out_of_range_cpu() {
        let err = LinuxBackend::new().pin_to_cpu(CPU_SETSIZE);
        assert!(matches!(err, Err(e) if e.kind() == io::ErrorKind::InvalidInput));
    }

    #[test]
    fn test_other_policy_applies_without_privileges() -> TestResult {
        let backend = LinuxBackend::new();
        thread::spawn(move || backend.apply_policy(SchedulingPolicy::Other, 0))
            .join()
            .map_err(|_panic| "policy thread panicked")??;
        Ok(())
    }
}
