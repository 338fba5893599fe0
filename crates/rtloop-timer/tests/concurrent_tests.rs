//! Concurrent arm/stop traffic against a firing dispatcher.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;
use rtloop_timer::{
    SchedulingMode, ServiceConfig, TimerClient, TimerError, TimerHandle, TimerKind, TimerService,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const THREADS: usize = 8;
const TIMERS_PER_THREAD: usize = 50;

fn start(max_timers: usize) -> Result<TimerService, rtloop_timer::InitError> {
    let config = ServiceConfig::builder()
        .poll_timeout(Duration::from_millis(10))
        .max_timers(max_timers)
        .build()?;
    TimerService::start(config, SchedulingMode::Standard)
}

#[test]
fn test_parallel_arm_and_stop_keeps_count() -> TestResult {
    let mut service = start(THREADS * TIMERS_PER_THREAD)?;
    let fired = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..THREADS)
        .map(|worker| {
            let client = service.client();
            let fired = Arc::clone(&fired);
            thread::spawn(move || -> Result<usize, rtloop_timer::TimerError> {
                let mut handles = Vec::with_capacity(TIMERS_PER_THREAD);
                for n in 0..TIMERS_PER_THREAD {
                    let fired = Arc::clone(&fired);
                    let interval = 1.0 + f64::from(u8::try_from((worker + n) % 7).unwrap_or(0));
                    handles.push(client.arm_timer(
                        interval,
                        TimerKind::Periodic,
                        None,
                        move |_, _| {
                            fired.fetch_add(1, Ordering::Relaxed);
                        },
                    )?);
                }

                let mut stopped = 0;
                for handle in handles.iter().step_by(2) {
                    client.stop_timer(*handle);
                    stopped += 1;
                }
                Ok(TIMERS_PER_THREAD - stopped)
            })
        })
        .collect();

    let mut outstanding = 0;
    for worker in workers {
        outstanding += worker.join().map_err(|_panic| "worker panicked")??;
    }

    thread::sleep(Duration::from_millis(50));
    assert_eq!(service.live_timers(), outstanding);
    assert_eq!(outstanding, THREADS * TIMERS_PER_THREAD / 2);
    assert!(fired.load(Ordering::Relaxed) > 0);

    let stats = service.stats();
    assert_eq!(stats.timers_armed, (THREADS * TIMERS_PER_THREAD) as u64);
    assert_eq!(stats.timers_stopped, (THREADS * TIMERS_PER_THREAD / 2) as u64);

    service.teardown()?;
    assert_eq!(service.live_timers(), 0);
    Ok(())
}

#[test]
fn test_no_callback_after_stop_returns() -> TestResult {
    let mut service = start(64)?;

    for _ in 0..20 {
        let stopped = Arc::new(AtomicBool::new(false));
        let violated = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));

        let (s, v, c) = (Arc::clone(&stopped), Arc::clone(&violated), Arc::clone(&calls));
        let handle = service.arm_timer(1.0, TimerKind::Periodic, None, move |_, _| {
            if s.load(Ordering::SeqCst) {
                v.store(true, Ordering::SeqCst);
            }
            c.fetch_add(1, Ordering::SeqCst);
            // Widen the window in which stop_timer can race the callback.
            thread::sleep(Duration::from_micros(300));
        })?;

        thread::sleep(Duration::from_millis(5));
        service.stop_timer(handle);
        stopped.store(true, Ordering::SeqCst);

        thread::sleep(Duration::from_millis(5));
        assert!(!violated.load(Ordering::SeqCst), "callback ran after stop_timer returned");
    }

    service.teardown()?;
    Ok(())
}

#[test]
fn test_stop_from_other_thread_while_firing() -> TestResult {
    let mut service = start(128)?;
    let handles: Vec<TimerHandle> = (0..100)
        .map(|_| service.arm_timer(1.0, TimerKind::Periodic, None, |_, _| {}))
        .collect::<Result<_, _>>()?;

    let client = service.client();
    let stopper = thread::spawn(move || {
        for handle in handles {
            client.stop_timer(handle);
        }
    });
    stopper.join().map_err(|_panic| "stopper panicked")?;

    assert_eq!(service.live_timers(), 0);
    let stats = service.stats();
    assert_eq!(stats.timers_armed, 100);
    assert_eq!(stats.timers_stopped, 100);

    service.teardown()?;
    Ok(())
}

#[derive(Debug, Clone)]
enum ClientOp {
    /// Arm a periodic timer with this many milliseconds.
    Arm(u8),
    /// Stop the n-th handle this client armed, live or already stopped.
    Stop(usize),
    /// Stop a handle that some client has already stopped.
    StopRetired(usize),
    /// Let the dispatcher fire for a moment.
    Pause,
}

fn client_op() -> impl Strategy<Value = ClientOp> {
    prop_oneof![
        4 => (1u8..=4).prop_map(ClientOp::Arm),
        3 => (0usize..64).prop_map(ClientOp::Stop),
        2 => (0usize..64).prop_map(ClientOp::StopRetired),
        1 => Just(ClientOp::Pause),
    ]
}

#[derive(Debug, Default)]
struct ClientModel {
    armed: u64,
    stopped: u64,
    live: Vec<TimerHandle>,
}

fn run_client(
    client: &TimerClient,
    ops: &[ClientOp],
    retired: &Mutex<Vec<TimerHandle>>,
) -> Result<ClientModel, TimerError> {
    let mut model = ClientModel::default();
    let mut issued: Vec<TimerHandle> = Vec::new();

    for op in ops {
        match *op {
            ClientOp::Arm(ms) => {
                let handle = client.arm_timer(f64::from(ms), TimerKind::Periodic, None, |_, _| {})?;
                issued.push(handle);
                model.live.push(handle);
                model.armed += 1;
            }
            ClientOp::Stop(n) => {
                let Some(handle) = issued.get(n % issued.len().max(1)).copied() else {
                    continue;
                };
                client.stop_timer(handle);
                if let Some(pos) = model.live.iter().position(|live| *live == handle) {
                    model.live.swap_remove(pos);
                    model.stopped += 1;
                    retired.lock().push(handle);
                }
            }
            ClientOp::StopRetired(n) => {
                let handle = {
                    let pool = retired.lock();
                    pool.get(n % pool.len().max(1)).copied()
                };
                if let Some(handle) = handle {
                    client.stop_timer(handle);
                }
            }
            ClientOp::Pause => thread::sleep(Duration::from_millis(1)),
        }
    }
    Ok(model)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_concurrent_clients_match_model(
        scripts in prop::collection::vec(prop::collection::vec(client_op(), 1..48), 2..=4)
    ) {
        let mut service = start(256).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let retired = Mutex::new(Vec::new());

        let outcomes: Vec<_> = thread::scope(|scope| {
            let workers: Vec<_> = scripts
                .iter()
                .map(|ops| {
                    let client = service.client();
                    let retired = &retired;
                    scope.spawn(move || run_client(&client, ops, retired))
                })
                .collect();
            workers.into_iter().map(|worker| worker.join()).collect()
        });

        let (mut armed, mut stopped, mut live) = (0u64, 0u64, Vec::new());
        for outcome in outcomes {
            let model = outcome
                .map_err(|_panic| TestCaseError::fail("client thread panicked"))?
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            armed += model.armed;
            stopped += model.stopped;
            live.extend(model.live);
        }

        let client = service.client();
        prop_assert_eq!(service.live_timers(), live.len());
        for handle in &live {
            prop_assert!(client.contains(*handle), "live timer {} lost", handle);
        }
        for handle in retired.lock().iter() {
            prop_assert!(!client.contains(*handle), "stopped timer {} still registered", handle);
        }

        let stats = service.stats();
        prop_assert_eq!(stats.timers_armed, armed);
        prop_assert_eq!(stats.timers_stopped, stopped);
        prop_assert_eq!(stats.arm_failures, 0);

        service.teardown().map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(service.live_timers(), 0);
        prop_assert_eq!(service.stats().timers_stopped, armed);
    }
}
