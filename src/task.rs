//! # Task Model
//!
//! Static description of a periodic task and the per-task timing record
//! its scheduler maintains.
//!
//! - [`TaskDescriptor`]: name, priority, period, affinity and policy. Set
//!   at registration and immutable afterwards.
//! - [`TaskState`]: lifecycle as seen by the runtime.
//! - [`ActivationRecord`]: activation counter, inter-arrival bounds and
//!   overrun/lateness counters. Owned exclusively by the task's scheduler;
//!   never shared across threads, so no locking.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::config::{MAX_RT_PRIORITY, MIN_RT_PRIORITY};
use crate::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
///
/// ```text
///   ┌─────────┐   Runtime::start()   ┌─────────┐   body returns   ┌────────────┐
///   │ Created │ ───────────────────► │ Running │ ───────────────► │ Terminated │
///   └─────────┘                      └─────────┘                  └────────────┘
/// ```
///
/// A task whose start was rejected stays `Created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Registered, not yet started.
    Created = 0,
    /// Thread spawned and configured; the body is executing.
    Running = 1,
    /// The body returned, through cancellation, end of input or an error.
    Terminated = 2,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Running,
            _ => Self::Terminated,
        }
    }
}

/// Task state readable by the runtime and writable by the task thread.
#[derive(Debug, Clone)]
pub struct SharedTaskState(Arc<AtomicU8>);

impl SharedTaskState {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(TaskState::Created as u8)))
    }

    pub fn get(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: TaskState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for SharedTaskState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Scheduling policy and affinity
// ---------------------------------------------------------------------------

/// OS scheduling class a task thread runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    /// Default time-sharing policy. The priority is kept as a rank for
    /// bookkeeping only; no privileges needed.
    #[default]
    Other,
    /// `SCHED_FIFO` at the descriptor's priority. Needs `CAP_SYS_NICE` or an
    /// `RLIMIT_RTPRIO` that covers the priority.
    Fifo,
}

/// Set of cores a task may run on. The empty set means "no pinning".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Affinity {
    cores: BTreeSet<usize>,
}

impl Affinity {
    /// No pinning: the OS may place the task on any core.
    pub fn any() -> Self {
        Self::default()
    }

    /// Pin to a single core.
    pub fn core(core: usize) -> Self {
        Self {
            cores: BTreeSet::from([core]),
        }
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        !self.cores.is_empty()
    }

    /// Allowed cores in ascending order.
    pub fn cores(&self) -> impl Iterator<Item = usize> + '_ {
        self.cores.iter().copied()
    }
}

// ---------------------------------------------------------------------------
// Task descriptor
// ---------------------------------------------------------------------------

/// Static configuration of a task, fixed at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    /// Unique name within the runtime; also the OS thread name.
    pub name: String,

    /// Priority rank, higher = more urgent. Must lie in
    /// `MIN_RT_PRIORITY..=MAX_RT_PRIORITY` when `policy` is `Fifo`.
    pub priority: u8,

    /// Activation period. Queue-driven tasks keep it for reporting only.
    pub period: Duration,

    /// Cores the thread is pinned to.
    pub affinity: Affinity,

    pub policy: SchedPolicy,
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            priority: MIN_RT_PRIORITY,
            period,
            affinity: Affinity::any(),
            policy: SchedPolicy::Other,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn with_policy(mut self, policy: SchedPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Whether the priority is accepted by the configured policy.
    pub fn priority_in_range(&self) -> bool {
        match self.policy {
            SchedPolicy::Other => true,
            SchedPolicy::Fifo => (MIN_RT_PRIORITY..=MAX_RT_PRIORITY).contains(&self.priority),
        }
    }
}

// ---------------------------------------------------------------------------
// Activation record
// ---------------------------------------------------------------------------

/// Timing record of one periodic task.
///
/// The first `boot_iter - 1` activations feed the counters but not the
/// inter-arrival bounds; activation number `boot_iter` initializes both
/// bounds, and every later activation may widen them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationRecord {
    /// Number of activations so far.
    pub activations: u64,

    /// Instant of the most recent activation.
    pub last_activation: Option<Instant>,

    /// Absolute instant the task will wake at next.
    pub next_wakeup: Option<Instant>,

    /// Smallest inter-arrival time observed after warm-up.
    pub min_iat: Option<Duration>,

    /// Largest inter-arrival time observed after warm-up.
    pub max_iat: Option<Duration>,

    /// Periods missed, as reported by an overrun-counting wait.
    pub overruns: u64,

    /// Activations later than the configured lag threshold.
    pub late_activations: u64,

    /// Worst delay between a scheduled instant and the actual wake-up.
    pub max_lateness: Duration,
}

impl ActivationRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an activation at `at` with the given inter-arrival time.
    ///
    /// Returns true if the min/max bounds changed, which is the moment the
    /// bounds are worth reporting.
    pub fn observe(&mut self, at: Instant, inter_arrival: Duration, boot_iter: u64) -> bool {
        self.activations += 1;
        self.last_activation = Some(at);

        if self.activations < boot_iter {
            return false;
        }

        match (self.min_iat, self.max_iat) {
            (Some(min), Some(max)) => {
                let mut changed = false;
                if inter_arrival < min {
                    self.min_iat = Some(inter_arrival);
                    changed = true;
                }
                if inter_arrival > max {
                    self.max_iat = Some(inter_arrival);
                    changed = true;
                }
                changed
            }
            _ => {
                self.min_iat = Some(inter_arrival);
                self.max_iat = Some(inter_arrival);
                true
            }
        }
    }

    /// Record missed periods.
    pub fn record_overruns(&mut self, missed: u64) {
        self.overruns += missed;
    }

    /// Record how late an activation was relative to its schedule.
    /// Returns true if it exceeds `threshold`.
    pub fn record_lateness(&mut self, lateness: Duration, threshold: Option<Duration>) -> bool {
        if lateness > self.max_lateness {
            self.max_lateness = lateness;
        }
        match threshold {
            Some(limit) if lateness > limit => {
                self.late_activations += 1;
                true
            }
            _ => false,
        }
    }

    /// Inter-arrival jitter: spread between the observed bounds.
    pub fn jitter(&self) -> Option<Duration> {
        match (self.min_iat, self.max_iat) {
            (Some(min), Some(max)) => Some(max.saturating_sub(min)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
