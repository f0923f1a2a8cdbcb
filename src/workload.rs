//! # Workload Simulator
//!
//! Synthetic CPU burn standing in for a real task payload: the composite
//! trapezoidal integral of `f(x) = 1 / (1 + x²)` over `[lower, upper]`.
//!
//! The result is deterministic for fixed parameters and only matters as a
//! way to keep the computation from being optimized out. The execution
//! time is what counts: `sub_intervals` dials it.
//!
//! Each [`WorkloadSimulator`] times its first invocation and logs it once.
//! The "already reported" flag belongs to the instance, so every task that
//! owns a simulator reports its own first run.

use std::hint::black_box;

use tracing::info;

use crate::config::WorkloadConfig;
use crate::time::{subtract, Duration, Instant};

#[inline]
fn integrand(x: f64) -> f64 {
    1.0 / (1.0 + x * x)
}

/// Composite trapezoidal rule for `1/(1+x²)` over `[lower, upper]`.
///
/// `sub_intervals == 0` yields 0.
pub fn trapezoid(lower: f64, upper: f64, sub_intervals: u32) -> f64 {
    if sub_intervals == 0 {
        return 0.0;
    }
    let step = (upper - lower) / sub_intervals as f64;
    let mut sum = integrand(lower) + integrand(upper);
    for i in 1..sub_intervals {
        sum += 2.0 * integrand(lower + i as f64 * step);
    }
    sum * step / 2.0
}

/// Per-task instance of the synthetic load.
#[derive(Debug, Clone)]
pub struct WorkloadSimulator {
    task: String,
    params: WorkloadConfig,
    first_run: Option<Duration>,
}

impl WorkloadSimulator {
    pub fn new(task: impl Into<String>, params: WorkloadConfig) -> Self {
        Self {
            task: task.into(),
            params,
            first_run: None,
        }
    }

    pub fn params(&self) -> &WorkloadConfig {
        &self.params
    }

    /// Execution time of the first invocation, once it has happened.
    pub fn first_run(&self) -> Option<Duration> {
        self.first_run
    }

    /// Run the integration once. The first call per instance measures and
    /// logs its execution time; later calls do the same work silently.
    pub fn run(&mut self) -> f64 {
        let WorkloadConfig {
            lower,
            upper,
            sub_intervals,
        } = self.params;

        if self.first_run.is_some() {
            return black_box(trapezoid(black_box(lower), upper, sub_intervals));
        }

        let start = Instant::now();
        let value = black_box(trapezoid(black_box(lower), upper, sub_intervals));
        let elapsed = subtract(Instant::now(), start);
        self.first_run = Some(elapsed);
        info!(
            task = %self.task,
            sub_intervals,
            elapsed_us = elapsed.as_micros_f64(),
            integral = value,
            "workload execution time"
        );
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trapezoid_converges_to_arctan() {
        let value = trapezoid(0.0, 1.0, 10_000);
        assert!((value - std::f64::consts::FRAC_PI_4).abs() < 1e-8);
    }

    #[test]
    fn test_trapezoid_default_domain() {
        let value = trapezoid(0.0, 100.0, 200_000);
        assert!((value - 100f64.atan()).abs() < 1e-6);
    }

    #[test]
    fn test_trapezoid_degenerate_inputs() {
        assert_eq!(trapezoid(0.0, 1.0, 0), 0.0);
        assert_eq!(trapezoid(3.0, 3.0, 100), 0.0);
        // One subinterval is the plain trapezoid: (f(0) + f(1)) / 2.
        assert_eq!(trapezoid(0.0, 1.0, 1), 0.75);
    }

    #[test]
    fn test_deterministic_result() {
        let params = WorkloadConfig {
            lower: 0.0,
            upper: 10.0,
            sub_intervals: 1_000,
        };
        let mut sim = WorkloadSimulator::new("t", params);
        let first = sim.run();
        let second = sim.run();
        assert_eq!(first, second);
    }

    #[test]
    fn test_first_run_recorded_once_per_instance() {
        let params = WorkloadConfig {
            lower: 0.0,
            upper: 1.0,
            sub_intervals: 100,
        };
        let mut a = WorkloadSimulator::new("a", params);
        let mut b = WorkloadSimulator::new("b", params);
        assert_eq!(a.first_run(), None);

        a.run();
        let measured = a.first_run();
        assert!(measured.is_some());
        a.run();
        assert_eq!(a.first_run(), measured);

        // A second instance keeps its own flag.
        assert_eq!(b.first_run(), None);
        b.run();
        assert!(b.first_run().is_some());
    }
}
