//! rtloop-jitter - timer cycle jitter measurement
//!
//! Runs one periodic timer on a real-time dispatcher and then on a standard
//! one, and reports how far the observed cycle times stray from the
//! requested rate.

#![deny(static_mut_refs)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]

mod report;
mod stats;

use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use clap::{Parser, ValueEnum};
use parking_lot::Mutex;
use rtloop_timer::{RealtimeConfig, SchedulingPolicy, TimerKind, TimerService, Timespec};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::report::{Parameters, RunMode, RunReport};
use crate::stats::CycleStats;

#[derive(Parser, Debug)]
#[command(name = "rtloop-jitter")]
#[command(about = "Measure timer cycle jitter under real-time and standard scheduling")]
#[command(version)]
struct Cli {
    /// Scheduling policy of the real-time dispatcher
    #[arg(long, value_enum, default_value_t = PolicyArg::Fifo)]
    policy: PolicyArg,

    /// CPU core the real-time dispatcher is pinned to
    #[arg(long, default_value_t = 1)]
    cpu: usize,

    /// Timer rate in Hz
    #[arg(long, default_value_t = 500.0)]
    rate_hz: f64,

    /// Seconds to run each dispatcher
    #[arg(long, default_value_t = 15)]
    run_secs: u64,

    /// Upper band factor applied to the expected cycle time
    #[arg(long, default_value_t = 1.1)]
    upper: f64,

    /// Lower band factor applied to the expected cycle time
    #[arg(long, default_value_t = 0.9)]
    lower: f64,

    /// Which dispatchers to measure
    #[arg(long, value_enum, default_value_t = ModeArg::Both)]
    mode: ModeArg,

    /// Output in JSON format for machine parsing
    #[arg(long)]
    json: bool,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    Fifo,
    Rr,
    Other,
}

impl From<PolicyArg> for SchedulingPolicy {
    fn from(policy: PolicyArg) -> Self {
        match policy {
            PolicyArg::Fifo => SchedulingPolicy::Fifo,
            PolicyArg::Rr => SchedulingPolicy::RoundRobin,
            PolicyArg::Other => SchedulingPolicy::Other,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Both,
    Realtime,
    Standard,
}

impl ModeArg {
    fn runs(self) -> &'static [RunMode] {
        match self {
            ModeArg::Both => &[RunMode::Realtime, RunMode::Standard],
            ModeArg::Realtime => &[RunMode::Realtime],
            ModeArg::Standard => &[RunMode::Standard],
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("rtloop_jitter={log_level},rtloop_timer={log_level}").into()
            }),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if let Err(e) = run(&cli) {
        if cli.json {
            report::print_error_json(&e);
        } else {
            report::print_error_human(&e);
        }
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let params = parameters(cli)?;
    if !cli.json {
        report::print_parameters_human(&params);
    }

    let mut runs = Vec::new();
    for &mode in cli.mode.runs() {
        let report = measure(mode, &params)?;
        if !cli.json {
            report::print_run_human(&report);
        }
        runs.push(report);
    }

    if cli.json {
        report::print_json(&params, &runs);
    }
    Ok(())
}

fn parameters(cli: &Cli) -> Result<Parameters> {
    ensure!(
        cli.rate_hz.is_finite() && cli.rate_hz > 0.0,
        "--rate-hz must be a positive number, got {}",
        cli.rate_hz
    );
    ensure!(cli.run_secs > 0, "--run-secs must be at least 1");
    ensure!(
        cli.lower > 0.0 && cli.lower <= 1.0 && cli.upper >= 1.0,
        "band factors must satisfy 0 < lower <= 1 <= upper, got {} and {}",
        cli.lower,
        cli.upper
    );

    Ok(Parameters {
        policy: cli.policy.into(),
        cpu: cli.cpu,
        rate_hz: cli.rate_hz,
        run_secs: cli.run_secs,
        expected_ms: 1_000.0 / cli.rate_hz,
        lower: cli.lower,
        upper: cli.upper,
    })
}

fn start_service(mode: RunMode, params: &Parameters) -> Result<TimerService> {
    match mode {
        RunMode::Realtime => {
            let config = RealtimeConfig::new(params.policy, params.cpu);
            TimerService::initialize_realtime(config).with_context(|| {
                format!(
                    "failed to start {} dispatcher on CPU {}",
                    params.policy, params.cpu
                )
            })
        }
        RunMode::Standard => {
            TimerService::initialize_standard().context("failed to start standard dispatcher")
        }
    }
}

fn measure(mode: RunMode, params: &Parameters) -> Result<RunReport> {
    let mut service = start_service(mode, params)?;
    info!(%mode, cpus = ?service.dispatcher_affinity(), "measuring");

    let start = Timespec::now_monotonic().context("failed to read the monotonic clock")?;
    let cycles = Arc::new(Mutex::new(CycleStats::new(
        params.expected_ms,
        params.lower,
        params.upper,
        start,
    )));
    let recorder = Arc::clone(&cycles);

    let handle = service
        .arm_timer(params.expected_ms, TimerKind::Periodic, None, move |_, _| {
            match Timespec::now_monotonic() {
                Ok(now) => recorder.lock().record(now),
                Err(err) => warn!(error = %err, "clock read failed, cycle not recorded"),
            }
        })
        .context("failed to arm measurement timer")?;

    thread::sleep(Duration::from_secs(params.run_secs));

    service.stop_timer(handle);
    let service_stats = service.stats();
    let dispatcher_cpus = service.dispatcher_affinity().to_vec();
    service.teardown().context("dispatcher did not shut down cleanly")?;

    let summary = cycles.lock().summary(params.run_secs);
    info!(%mode, cycles = summary.cycles, "run finished");

    Ok(RunReport {
        mode,
        dispatcher_cpus,
        cycles: summary,
        service: service_stats,
    })
}
