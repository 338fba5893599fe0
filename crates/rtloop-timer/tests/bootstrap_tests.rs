//! Dispatcher bootstrap against a scripted scheduling backend.

use std::io;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rtloop_timer::{
    InitError, MemoryLockCount, RealtimeConfig, SchedulerBackend, SchedulingMode, SchedulingPolicy, ServiceConfig,
    TimerKind, TimerService,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    LockMemory,
    UnlockMemory,
    PriorityRange(SchedulingPolicy),
    ApplyPolicy(SchedulingPolicy, i32),
    PinToCpu(usize),
    CurrentAffinity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailAt {
    Nothing,
    LockMemory,
    ApplyPolicy,
    PinToCpu,
    CurrentAffinity,
}

/// Stands in for one process: services started on the same backend share
/// its memory lock count.
#[derive(Debug)]
struct ScriptedBackend {
    fail_at: Mutex<FailAt>,
    calls: Mutex<Vec<Call>>,
    memory_locks: MemoryLockCount,
}

impl ScriptedBackend {
    fn new(fail_at: FailAt) -> Arc<Self> {
        Arc::new(Self {
            fail_at: Mutex::new(fail_at),
            calls: Mutex::new(Vec::new()),
            memory_locks: MemoryLockCount::new(),
        })
    }

    fn fail_from_now_at(&self, at: FailAt) {
        *self.fail_at.lock() = at;
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn fails(&self, at: FailAt) -> io::Result<()> {
        if *self.fail_at.lock() == at {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        Ok(())
    }
}

impl SchedulerBackend for ScriptedBackend {
    fn lock_memory(&self) -> io::Result<()> {
        self.record(Call::LockMemory);
        self.fails(FailAt::LockMemory)
    }

    fn unlock_memory(&self) -> io::Result<()> {
        self.record(Call::UnlockMemory);
        Ok(())
    }

    fn memory_locks(&self) -> &MemoryLockCount {
        &self.memory_locks
    }

    fn priority_range(&self, policy: SchedulingPolicy) -> io::Result<RangeInclusive<i32>> {
        self.record(Call::PriorityRange(policy));
        Ok(if policy.is_realtime() { 1..=99 } else { 0..=0 })
    }

    fn apply_policy(&self, policy: SchedulingPolicy, priority: i32) -> io::Result<()> {
        self.record(Call::ApplyPolicy(policy, priority));
        self.fails(FailAt::ApplyPolicy)
    }

    fn pin_to_cpu(&self, cpu: usize) -> io::Result<()> {
        self.record(Call::PinToCpu(cpu));
        self.fails(FailAt::PinToCpu)
    }

    fn current_affinity(&self) -> io::Result<Vec<usize>> {
        self.record(Call::CurrentAffinity);
        self.fails(FailAt::CurrentAffinity)?;
        Ok(vec![2])
    }
}

fn config() -> Result<ServiceConfig, InitError> {
    ServiceConfig::builder()
        .poll_timeout(Duration::from_millis(10))
        .thread_name("rtloop-test")
        .build()
}

fn realtime() -> SchedulingMode {
    SchedulingMode::Realtime(RealtimeConfig::new(SchedulingPolicy::Fifo, 2).with_priority(80))
}

#[test]
fn test_realtime_bootstrap_applies_every_step() -> TestResult {
    let backend = ScriptedBackend::new(FailAt::Nothing);
    let mut service = TimerService::start_with_backend(config()?, realtime(), backend.clone())?;

    assert_eq!(service.dispatcher_affinity(), &[2]);
    assert_eq!(
        backend.calls(),
        vec![
            Call::PriorityRange(SchedulingPolicy::Fifo),
            Call::LockMemory,
            Call::ApplyPolicy(SchedulingPolicy::Fifo, 80),
            Call::PinToCpu(2),
            Call::CurrentAffinity,
        ]
    );

    // The dispatcher is live.
    service.arm_timer(1000.0, TimerKind::Periodic, None, |_, _| {})?;
    assert_eq!(service.live_timers(), 1);
    service.teardown()?;
    Ok(())
}

#[test]
fn test_memory_lock_failure_is_reported() -> TestResult {
    let backend = ScriptedBackend::new(FailAt::LockMemory);
    let result = TimerService::start_with_backend(config()?, realtime(), backend.clone());

    assert!(matches!(result, Err(InitError::MemoryLock(_))));
    assert_eq!(backend.memory_locks().holders(), 0);
    // No thread was started, so no scheduling call happened.
    assert_eq!(
        backend.calls(),
        vec![Call::PriorityRange(SchedulingPolicy::Fifo), Call::LockMemory]
    );
    Ok(())
}

#[test]
fn test_policy_failure_unlocks_memory() -> TestResult {
    let backend = ScriptedBackend::new(FailAt::ApplyPolicy);
    let result = TimerService::start_with_backend(config()?, realtime(), backend.clone());

    match result {
        Err(InitError::SchedulingPolicy { policy, source }) => {
            assert_eq!(policy, SchedulingPolicy::Fifo);
            assert_eq!(source.raw_os_error(), Some(libc::EPERM));
        }
        other => return Err(format!("unexpected bootstrap result: {other:?}").into()),
    }

    let calls = backend.calls();
    assert!(!calls.contains(&Call::PinToCpu(2)));
    assert_eq!(calls.last(), Some(&Call::UnlockMemory));
    Ok(())
}

#[test]
fn test_failed_start_keeps_memory_locked_for_running_service() -> TestResult {
    let backend = ScriptedBackend::new(FailAt::Nothing);
    let mut running = TimerService::start_with_backend(config()?, realtime(), backend.clone())?;
    assert_eq!(backend.memory_locks().holders(), 1);

    backend.fail_from_now_at(FailAt::PinToCpu);
    let failed = TimerService::start_with_backend(config()?, realtime(), backend.clone());
    assert!(matches!(failed, Err(InitError::Affinity { cpu: 2, .. })));

    // The running service still holds the only lock.
    let calls = backend.calls();
    assert_eq!(calls.iter().filter(|c| **c == Call::LockMemory).count(), 1);
    assert!(!calls.contains(&Call::UnlockMemory));
    assert_eq!(backend.memory_locks().holders(), 1);

    running.teardown()?;
    assert_eq!(backend.memory_locks().holders(), 0);
    assert_eq!(backend.calls().last(), Some(&Call::UnlockMemory));
    Ok(())
}

#[test]
fn test_memory_is_unlocked_by_the_last_service_only() -> TestResult {
    let backend = ScriptedBackend::new(FailAt::Nothing);
    let mut first = TimerService::start_with_backend(config()?, realtime(), backend.clone())?;
    let mut second = TimerService::start_with_backend(config()?, realtime(), backend.clone())?;
    assert_eq!(backend.memory_locks().holders(), 2);

    first.teardown()?;
    assert_eq!(backend.memory_locks().holders(), 1);
    assert!(!backend.calls().contains(&Call::UnlockMemory));

    second.teardown()?;
    assert_eq!(backend.memory_locks().holders(), 0);

    let calls = backend.calls();
    assert_eq!(calls.iter().filter(|c| **c == Call::LockMemory).count(), 1);
    assert_eq!(calls.iter().filter(|c| **c == Call::UnlockMemory).count(), 1);
    Ok(())
}

#[test]
fn test_affinity_failure_is_an_error_not_an_abort() -> TestResult {
    let backend = ScriptedBackend::new(FailAt::PinToCpu);
    let result = TimerService::start_with_backend(config()?, realtime(), backend.clone());

    assert!(matches!(result, Err(InitError::Affinity { cpu: 2, .. })));
    assert_eq!(backend.calls().last(), Some(&Call::UnlockMemory));
    Ok(())
}

#[test]
fn test_unreadable_affinity_is_not_fatal() -> TestResult {
    let backend = ScriptedBackend::new(FailAt::CurrentAffinity);
    let mut service = TimerService::start_with_backend(config()?, realtime(), backend)?;

    assert!(service.dispatcher_affinity().is_empty());
    service.teardown()?;
    Ok(())
}

#[test]
fn test_invalid_priority_is_rejected_before_any_side_effect() -> TestResult {
    let backend = ScriptedBackend::new(FailAt::Nothing);
    let mode = SchedulingMode::Realtime(
        RealtimeConfig::new(SchedulingPolicy::RoundRobin, 0).with_priority(120),
    );
    let result = TimerService::start_with_backend(config()?, mode, backend.clone());

    assert!(matches!(
        result,
        Err(InitError::InvalidPriority {
            policy: SchedulingPolicy::RoundRobin,
            priority: 120,
            min: 1,
            max: 99,
        })
    ));
    assert_eq!(
        backend.calls(),
        vec![Call::PriorityRange(SchedulingPolicy::RoundRobin)]
    );
    Ok(())
}

#[test]
fn test_memory_lock_can_be_disabled() -> TestResult {
    let backend = ScriptedBackend::new(FailAt::Nothing);
    let mode = SchedulingMode::Realtime(
        RealtimeConfig::new(SchedulingPolicy::Fifo, 2).with_lock_memory(false),
    );
    let mut service = TimerService::start_with_backend(config()?, mode, backend.clone())?;

    assert!(!backend.calls().contains(&Call::LockMemory));
    assert!(backend.calls().contains(&Call::ApplyPolicy(SchedulingPolicy::Fifo, 99)));
    service.teardown()?;
    Ok(())
}

#[test]
fn test_standard_mode_skips_scheduling() -> TestResult {
    let backend = ScriptedBackend::new(FailAt::Nothing);
    let mut service =
        TimerService::start_with_backend(config()?, SchedulingMode::Standard, backend.clone())?;

    assert_eq!(backend.calls(), vec![Call::CurrentAffinity]);
    assert_eq!(service.mode(), &SchedulingMode::Standard);
    service.teardown()?;
    Ok(())
}

#[test]
fn test_invalid_configuration_fails_before_backend_use() -> TestResult {
    let backend = ScriptedBackend::new(FailAt::Nothing);
    let config = ServiceConfig {
        poll_timeout: Duration::ZERO,
        ..ServiceConfig::default()
    };
    let result = TimerService::start_with_backend(config, realtime(), backend.clone());

    assert!(matches!(result, Err(InitError::InvalidConfiguration(_))));
    assert!(backend.calls().is_empty());
    Ok(())
}
