//! Human-readable and JSON output.

use std::fmt;

use anyhow::Error;
use colored::Colorize;
use rtloop_timer::{SchedulingPolicy, TimerStats};
use serde::Serialize;
use serde_json::json;

use crate::stats::CycleSummary;

/// Dispatcher flavour measured by one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Real-time policy, pinned CPU, locked memory.
    Realtime,
    /// Default OS scheduling.
    Standard,
}

impl RunMode {
    fn title(self) -> &'static str {
        match self {
            RunMode::Realtime => "Real-time priority dispatcher",
            RunMode::Standard => "Standard priority dispatcher",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Realtime => write!(f, "realtime"),
            RunMode::Standard => write!(f, "standard"),
        }
    }
}

/// Parameters shared by every run.
#[derive(Debug, Clone, Serialize)]
pub struct Parameters {
    /// Policy of the real-time dispatcher.
    pub policy: SchedulingPolicy,
    /// CPU the real-time dispatcher is pinned to.
    pub cpu: usize,
    /// Requested timer rate.
    pub rate_hz: f64,
    /// Duration of each run.
    pub run_secs: u64,
    /// Expected cycle time derived from the rate.
    pub expected_ms: f64,
    /// Lower band factor.
    pub lower: f64,
    /// Upper band factor.
    pub upper: f64,
}

/// Outcome of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Which dispatcher was measured.
    pub mode: RunMode,
    /// CPUs the dispatcher was allowed to run on.
    pub dispatcher_cpus: Vec<usize>,
    /// Cycle statistics.
    pub cycles: CycleSummary,
    /// Timer service counters at the end of the run.
    pub service: TimerStats,
}

/// Print the input parameters.
pub fn print_parameters_human(params: &Parameters) {
    println!("{}", "Input parameters".bold());
    println!("  RT thread policy:    {}", params.policy);
    println!("  RT thread CPU core:  {}", params.cpu);
    println!("  Cycle rate:          {:.2} Hz", params.rate_hz);
    println!("  Run time per thread: {} s", params.run_secs);
    println!();
}

/// Print one run.
pub fn print_run_human(report: &RunReport) {
    println!("{}", report.mode.title().bold());
    println!("  Dispatcher CPUs: {:?}", report.dispatcher_cpus);

    let c = &report.cycles;
    println!("  Minimum time:    {:.3} ms", c.min_ms);
    println!("  Maximum time:    {:.3} ms", c.max_ms);
    println!("  Average time:    {:.3} ms", c.avg_ms);
    println!("  Frequency:       {:.3} Hz", c.frequency_hz);
    println!("  p99 deviation:   {} us", c.p99_deviation_us);

    let band = format!("{} of {} cycles", c.out_of_band, c.measured_cycles);
    if c.out_of_band == 0 {
        println!("  Out of band:     {}", band.green());
    } else {
        println!("  Out of band:     {}", band.yellow());
    }

    let overruns = report.service.overruns();
    if overruns > 0 {
        println!("  Overruns:        {}", overruns.to_string().red());
    }
    println!();
}

/// Print the whole measurement as one JSON document.
pub fn print_json(params: &Parameters, runs: &[RunReport]) {
    let output = json!({
        "success": true,
        "parameters": params,
        "runs": runs,
    });
    match serde_json::to_string_pretty(&output) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("Failed to format report as JSON: {e}"),
    }
}

/// Print an error in JSON format.
pub fn print_error_json(error: &Error) {
    let chain: Vec<String> = error.chain().skip(1).map(ToString::to_string).collect();
    let output = json!({
        "success": false,
        "error": {
            "message": error.to_string(),
            "causes": chain,
        }
    });
    match serde_json::to_string_pretty(&output) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("Failed to format error as JSON: {e}"),
    }
}

/// Print an error with its cause chain.
pub fn print_error_human(error: &Error) {
    eprintln!("{} {}", "Error:".red().bold(), error);
    for cause in error.chain().skip(1) {
        eprintln!("  {} {}", "Caused by:".yellow(), cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_run_mode_serializes_as_snake_case() -> TestResult {
        assert_eq!(serde_json::to_value(RunMode::Realtime)?, json!("realtime"));
        assert_eq!(serde_json::to_value(RunMode::Standard)?, json!("standard"));
        Ok(())
    }

    #[test]
    fn test_run_mode_display_matches_json() -> TestResult {
        for mode in [RunMode::Realtime, RunMode::Standard] {
            assert_eq!(serde_json::to_value(mode)?, json!(mode.to_string()));
        }
        assert_eq!(RunMode::Realtime.title(), "Real-time priority dispatcher");
        Ok(())
    }
}
