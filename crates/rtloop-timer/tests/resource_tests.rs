//! Descriptor accounting. Kept as a single test so that no other test in
//! this binary opens or closes descriptors concurrently.

use std::fs;
use std::time::Duration;

use rtloop_timer::{SchedulingMode, ServiceConfig, TimerKind, TimerService};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn open_descriptors() -> std::io::Result<usize> {
    Ok(fs::read_dir("/proc/self/fd")?.count())
}

#[test]
fn test_arm_stop_and_teardown_release_descriptors() -> TestResult {
    let config = ServiceConfig::builder()
        .poll_timeout(Duration::from_millis(10))
        .max_timers(64)
        .build()?;
    let mut service = TimerService::start(config, SchedulingMode::Standard)?;
    let baseline = open_descriptors()?;

    // Arm/stop cycles across every slot position.
    for round in 0..5 {
        let handles = (0..32)
            .map(|_| service.arm_timer(1.0, TimerKind::Periodic, None, |_, _| {}))
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(open_descriptors()?, baseline + 32, "round {round}");

        // Interleave removal order: middle, tail, head.
        for handle in handles.iter().skip(10).take(10).chain(handles.iter().rev().take(10)) {
            service.stop_timer(*handle);
        }
        for handle in &handles {
            service.stop_timer(*handle);
        }
        assert_eq!(service.live_timers(), 0);
        assert_eq!(open_descriptors()?, baseline, "round {round}");
    }

    // Failed arms leave nothing behind.
    let result = service.arm_timer(-1.0, TimerKind::SingleShot, None, |_, _| {});
    assert!(result.is_err());
    assert_eq!(open_descriptors()?, baseline);

    // Teardown closes whatever is still registered.
    for _ in 0..16 {
        service.arm_timer(2.0, TimerKind::Periodic, None, |_, _| {})?;
    }
    assert_eq!(open_descriptors()?, baseline + 16);
    service.teardown()?;
    assert_eq!(open_descriptors()?, baseline);

    let stats = service.stats();
    assert_eq!(stats.timers_armed, 5 * 32 + 16);
    assert_eq!(stats.timers_stopped, stats.timers_armed);
    Ok(())
}
