//! # Harness Configuration
//!
//! Compile-time constants governing the scheduler and workload, plus the
//! deployment-level [`HarnessConfig`] that the binary loads from a TOML file
//! and overrides from the command line.
//!
//! Every value here is static for the lifetime of a run. There is no
//! feedback loop that retunes periods or loads at runtime.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{HarnessError, Result};
use crate::scheduler::WaitMode;
use crate::time::Duration;

// ---------------------------------------------------------------------------
// Compile-time constants
// ---------------------------------------------------------------------------

/// Maximum number of tasks the runtime can manage simultaneously.
/// Registration past this limit fails with `ResourceExhausted`.
pub const MAX_TASKS: usize = 8;

/// Nanoseconds in one second. Upper (exclusive) bound of the
/// nanosecond field of every `Instant` and `Duration`.
pub const NS_IN_SEC: u32 = 1_000_000_000;

/// Default activation period: 100 ms.
pub const DEFAULT_PERIOD_MS: u64 = 100;

/// Number of activations excluded from min/max inter-arrival tracking.
/// The first activations of a thread show irregular timing (cold caches,
/// page faults, branch predictors).
pub const BOOT_ITER: u64 = 10;

/// Lowest `SCHED_FIFO` priority accepted by Linux.
pub const MIN_RT_PRIORITY: u8 = 1;

/// Highest `SCHED_FIFO` priority accepted by Linux.
pub const MAX_RT_PRIORITY: u8 = 99;

/// Integration lower bound for the synthetic load.
pub const WORKLOAD_LOWER: f64 = 0.0;

/// Integration upper bound for the synthetic load.
pub const WORKLOAD_UPPER: f64 = 100.0;

/// Number of trapezoid subintervals. Dominates the execution time of the
/// synthetic load; tune this to dial a target CPU burn.
pub const WORKLOAD_SUB_INTERVALS: u32 = 200_000;

/// Sliding-window length of the aggregation stage.
pub const WINDOW_SIZE: usize = 5;

/// Default message capacity of each pipeline queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Name of the queue between the sensor and processing stages.
pub const SENSOR_QUEUE: &str = "queue_sensor";

/// Name of the queue between the processing and storage stages.
pub const PROCESSING_QUEUE: &str = "queue_processing";

// ---------------------------------------------------------------------------
// Deployment configuration
// ---------------------------------------------------------------------------

/// Which set of tasks the binary launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// A single periodic thread running the integration load.
    Jitter,
    /// Three periodic tasks at different priorities, each with its own load.
    Multi,
    /// Sensor → processing → storage pipeline over two queues.
    Pipeline,
}

/// Parameters of the synthetic integration load.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub lower: f64,
    pub upper: f64,
    pub sub_intervals: u32,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            lower: WORKLOAD_LOWER,
            upper: WORKLOAD_UPPER,
            sub_intervals: WORKLOAD_SUB_INTERVALS,
        }
    }
}

/// Files and queue sizing of the pipeline mode.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub queue_capacity: usize,
    /// Close the sensor queue when the input runs out so the downstream
    /// stages drain and exit. When false the sensor keeps its period and
    /// idles until shutdown.
    pub stop_at_end_of_input: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("sensordata.txt"),
            output: PathBuf::from("sensordataFiltered.txt"),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stop_at_end_of_input: false,
        }
    }
}

/// Complete deployment configuration.
///
/// Every field has a default, so an empty TOML file is a valid config.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub mode: Mode,
    pub period_ms: u64,
    pub wait_mode: WaitMode,
    pub boot_iter: u64,
    /// Real-time priority for every task. `None` keeps the default
    /// time-sharing policy, which needs no privileges.
    pub priority: Option<u8>,
    /// Core every task is pinned to. `None` leaves affinity untouched.
    pub cpu: Option<usize>,
    pub lock_memory: bool,
    /// Lateness above which an activation is logged as late.
    pub lag_warning_ms: Option<u64>,
    pub workload: WorkloadConfig,
    pub pipeline: PipelineConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Jitter,
            period_ms: DEFAULT_PERIOD_MS,
            wait_mode: WaitMode::AbsoluteSleep,
            boot_iter: BOOT_ITER,
            priority: None,
            cpu: None,
            lock_memory: false,
            lag_warning_ms: None,
            workload: WorkloadConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| HarnessError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject values no deployment can run with.
    pub fn validate(&self) -> Result<()> {
        if self.period_ms == 0 {
            return Err(HarnessError::Config("period_ms must be non-zero".into()));
        }
        if self.workload.sub_intervals == 0 {
            return Err(HarnessError::Config(
                "workload.sub_intervals must be non-zero".into(),
            ));
        }
        if self.workload.upper <= self.workload.lower {
            return Err(HarnessError::Config(
                "workload.upper must be greater than workload.lower".into(),
            ));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(HarnessError::Config(
                "pipeline.queue_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Activation period as a harness duration.
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// Lag warning threshold, if configured.
    pub fn lag_warning(&self) -> Option<Duration> {
        self.lag_warning_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config = HarnessConfig::from_toml_str("").unwrap();
        assert_eq!(config, HarnessConfig::default());
        assert_eq!(config.boot_iter, BOOT_ITER);
        assert_eq!(config.period(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = HarnessConfig::from_toml_str(
            r#"
            mode = "pipeline"
            period_ms = 250
            wait_mode = "overrun-counting"

            [pipeline]
            input = "in.txt"
            stop_at_end_of_input = true
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, Mode::Pipeline);
        assert_eq!(config.period_ms, 250);
        assert_eq!(config.wait_mode, WaitMode::OverrunCounting);
        assert_eq!(config.pipeline.input, PathBuf::from("in.txt"));
        assert!(config.pipeline.stop_at_end_of_input);
        assert_eq!(config.pipeline.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.workload, WorkloadConfig::default());
    }

    #[test]
    fn test_zero_period_rejected() {
        let err = HarnessConfig::from_toml_str("period_ms = 0").unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn test_malformed_toml_rejected() {
        let err = HarnessConfig::from_toml_str("mode = 3").unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }
}
