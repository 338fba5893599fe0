//! Cycle-time statistics for one measurement run.

use rtloop_timer::{Timespec, duration_between};
use serde::Serialize;

/// Cycles at the start of a run that are left out of min/max/average, while
/// the dispatcher and caches settle.
pub const WARMUP_CYCLES: u64 = 2;

const DEFAULT_MAX_SAMPLES: usize = 100_000;

/// Accumulates the time between consecutive timer callbacks.
///
/// The first interval is measured from the run's start time. Deviation
/// samples are kept in a bounded ring buffer for percentile estimation.
#[derive(Debug, Clone)]
pub struct CycleStats {
    expected_ms: f64,
    lower_ms: f64,
    upper_ms: f64,
    previous: Timespec,
    cycles: u64,
    measured: u64,
    min_ms: f64,
    max_ms: f64,
    total_ms: f64,
    out_of_band: u64,
    deviation_samples_us: Vec<u64>,
    max_samples: usize,
    next_sample_index: usize,
}

/// Finalised statistics of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    /// Callbacks observed.
    pub cycles: u64,
    /// Cycles that contributed to min/max/average.
    pub measured_cycles: u64,
    /// Shortest cycle in milliseconds.
    pub min_ms: f64,
    /// Longest cycle in milliseconds.
    pub max_ms: f64,
    /// Mean cycle in milliseconds.
    pub avg_ms: f64,
    /// Cycles outside the lower/upper band.
    pub out_of_band: u64,
    /// 99th percentile of the absolute deviation from the expected cycle, in
    /// microseconds.
    pub p99_deviation_us: u64,
    /// Callbacks per second over the run, counted the way the cycle counter
    /// is read at the end of the run.
    pub frequency_hz: f64,
}

impl CycleStats {
    /// Start collecting for cycles of `expected_ms`, flagging those outside
    /// `[lower * expected_ms, upper * expected_ms]`.
    #[must_use]
    pub fn new(expected_ms: f64, lower: f64, upper: f64, start: Timespec) -> Self {
        Self::with_capacity(expected_ms, lower, upper, start, DEFAULT_MAX_SAMPLES)
    }

    /// Like [`CycleStats::new`] with a custom deviation sample capacity.
    #[must_use]
    pub fn with_capacity(
        expected_ms: f64,
        lower: f64,
        upper: f64,
        start: Timespec,
        max_samples: usize,
    ) -> Self {
        Self {
            expected_ms,
            lower_ms: lower * expected_ms,
            upper_ms: upper * expected_ms,
            previous: start,
            cycles: 0,
            measured: 0,
            min_ms: f64::INFINITY,
            max_ms: 0.0,
            total_ms: 0.0,
            out_of_band: 0,
            deviation_samples_us: Vec::with_capacity(max_samples.min(DEFAULT_MAX_SAMPLES)),
            max_samples,
            next_sample_index: 0,
        }
    }

    /// Record a callback observed at `now`.
    pub fn record(&mut self, now: Timespec) {
        let elapsed_ms = duration_between(self.previous, now).as_millis_f64();
        self.previous = now;

        if self.cycles >= WARMUP_CYCLES {
            self.measure(elapsed_ms);
        }
        self.cycles += 1;
    }

    fn measure(&mut self, elapsed_ms: f64) {
        self.measured += 1;
        self.total_ms += elapsed_ms;
        self.min_ms = self.min_ms.min(elapsed_ms);
        self.max_ms = self.max_ms.max(elapsed_ms);

        if elapsed_ms < self.lower_ms || elapsed_ms > self.upper_ms {
            self.out_of_band += 1;
        }

        #[expect(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "absolute deviation in microseconds, far below u64::MAX"
        )]
        let deviation_us = ((elapsed_ms - self.expected_ms).abs() * 1_000.0).round() as u64;
        self.push_sample(deviation_us);
    }

    fn push_sample(&mut self, sample: u64) {
        if self.max_samples == 0 {
            return;
        }

        if self.deviation_samples_us.len() < self.max_samples {
            self.deviation_samples_us.push(sample);
        } else if let Some(slot) = self.deviation_samples_us.get_mut(self.next_sample_index) {
            *slot = sample;
            self.next_sample_index = (self.next_sample_index + 1) % self.max_samples;
        }
    }

    /// Percentile (0.0 to 1.0) of the retained deviation samples, in
    /// microseconds. 0 without samples.
    #[must_use]
    pub fn percentile_deviation_us(&self, percentile: f64) -> u64 {
        if self.deviation_samples_us.is_empty() {
            return 0;
        }

        let mut scratch = self.deviation_samples_us.clone();
        let len = scratch.len();
        #[expect(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss,
            reason = "index into a bounded sample buffer, clamped to len - 1"
        )]
        let index = ((len as f64 * percentile.clamp(0.0, 1.0)) as usize).min(len - 1);
        let (_, value, _) = scratch.select_nth_unstable(index);
        *value
    }

    /// Finalise the run that lasted `run_secs` seconds.
    #[must_use]
    #[expect(
        clippy::cast_precision_loss,
        reason = "cycle counts stay far below 2^52"
    )]
    pub fn summary(&self, run_secs: u64) -> CycleSummary {
        let measured = self.measured > 0;
        CycleSummary {
            cycles: self.cycles,
            measured_cycles: self.measured,
            min_ms: if measured { self.min_ms } else { 0.0 },
            max_ms: self.max_ms,
            avg_ms: if measured {
                self.total_ms / self.measured as f64
            } else {
                0.0
            },
            out_of_band: self.out_of_band,
            p99_deviation_us: self.percentile_deviation_us(0.99),
            frequency_hz: if run_secs == 0 {
                0.0
            } else {
                (self.cycles + 1) as f64 / run_secs as f64
            },
        }
    }
}
