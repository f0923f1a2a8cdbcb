//! # Periodic Scheduler
//!
//! The per-task loop that turns a thread into a periodic activity.
//!
//! ## Schedule
//!
//! ```text
//!   start:   next = now + period
//!   cycle:   wait until next (absolute)
//!            at   = now
//!            next = next + period        ← independent of `at`
//!            iat  = at - previous_at
//! ```
//!
//! Wake-ups always target an absolute instant, and `next` advances by
//! exactly one period per activation no matter how late the thread woke.
//! Execution-time variance therefore never accumulates into drift.
//!
//! ## Phases
//!
//! ```text
//!   Initializing ──► Waiting ──► Executing ──► Waiting ──► ... ──► Terminated
//! ```
//!
//! The loop is infinite except for three exits: the runtime's shutdown
//! token, the work closure returning `ControlFlow::Break`, and an error
//! (including an overrun in [`WaitMode::OverrunCounting`]).
//!
//! ## Wait modes
//!
//! - [`WaitMode::AbsoluteSleep`]: `clock_nanosleep` with `TIMER_ABSTIME`.
//!   The kernel never reports a missed deadline, so an overloaded task
//!   falls further behind without failing. Lateness is still measured and
//!   can be flagged through a lag threshold.
//! - [`WaitMode::OverrunCounting`]: a `timerfd` whose expiration count is
//!   the overrun count. Any missed period terminates the loop with
//!   `HarnessError::Overrun`; persistent overruns indicate a load/period
//!   mismatch that no amount of catching up fixes.

use std::ops::ControlFlow;

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::arch::linux::{self, TimerFd};
use crate::config::BOOT_ITER;
use crate::error::{HarnessError, Result};
use crate::sync::ShutdownToken;
use crate::task::ActivationRecord;
use crate::time::{subtract, Duration, Instant};

// ---------------------------------------------------------------------------
// Wait primitives
// ---------------------------------------------------------------------------

/// How a periodic task blocks between activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum WaitMode {
    /// Absolute-deadline sleep, no overrun detection.
    #[serde(alias = "sleep")]
    #[value(name = "sleep")]
    AbsoluteSleep,
    /// Periodic timer reporting missed periods; the first overrun is fatal.
    #[serde(alias = "overrun")]
    #[value(name = "overrun")]
    OverrunCounting,
}

/// Blocking primitive behind the periodic loop.
pub trait PeriodicWait: Send {
    fn mode(&self) -> WaitMode;

    /// Current monotonic time.
    fn now(&self) -> Instant;

    /// Prepare a schedule whose first deadline is `first`.
    fn arm(&mut self, _first: Instant, _period: Duration) -> Result<()> {
        Ok(())
    }

    /// Block until `deadline`. Returns how many periods elapsed without an
    /// activation before this wake-up; primitives that cannot tell return 0.
    fn wait_until(&mut self, deadline: Instant) -> Result<u64>;
}

impl<W: PeriodicWait + ?Sized> PeriodicWait for Box<W> {
    fn mode(&self) -> WaitMode {
        (**self).mode()
    }

    fn now(&self) -> Instant {
        (**self).now()
    }

    fn arm(&mut self, first: Instant, period: Duration) -> Result<()> {
        (**self).arm(first, period)
    }

    fn wait_until(&mut self, deadline: Instant) -> Result<u64> {
        (**self).wait_until(deadline)
    }
}

/// `clock_nanosleep(TIMER_ABSTIME)` on the monotonic clock.
#[derive(Debug, Default)]
pub struct AbsoluteSleep;

impl PeriodicWait for AbsoluteSleep {
    fn mode(&self) -> WaitMode {
        WaitMode::AbsoluteSleep
    }

    fn now(&self) -> Instant {
        linux::monotonic_now()
    }

    fn wait_until(&mut self, deadline: Instant) -> Result<u64> {
        linux::sleep_until(deadline)?;
        Ok(0)
    }
}

/// Periodic `timerfd` armed in lockstep with the schedule.
#[derive(Debug)]
pub struct OverrunTimer {
    timer: TimerFd,
}

impl OverrunTimer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            timer: TimerFd::new()?,
        })
    }
}

impl PeriodicWait for OverrunTimer {
    fn mode(&self) -> WaitMode {
        WaitMode::OverrunCounting
    }

    fn now(&self) -> Instant {
        linux::monotonic_now()
    }

    fn arm(&mut self, first: Instant, period: Duration) -> Result<()> {
        self.timer.arm(first, period)
    }

    fn wait_until(&mut self, _deadline: Instant) -> Result<u64> {
        // The timer fires on the same absolute grid the scheduler computes.
        let expirations = self.timer.wait()?;
        Ok(expirations.saturating_sub(1))
    }
}

/// Build the OS wait primitive for a mode.
pub fn waiter_for(mode: WaitMode) -> Result<Box<dyn PeriodicWait>> {
    Ok(match mode {
        WaitMode::AbsoluteSleep => Box::new(AbsoluteSleep),
        WaitMode::OverrunCounting => Box::new(OverrunTimer::new()?),
    })
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Phase of the periodic loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Initializing,
    Waiting,
    Executing,
    Terminated,
}

/// One wake-up of a periodic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    /// 1-based activation number.
    pub index: u64,
    /// When the task actually woke.
    pub at: Instant,
    /// When the task was scheduled to wake.
    pub scheduled: Instant,
    /// Time since the previous activation (since start for the first one).
    pub inter_arrival: Duration,
    /// `at - scheduled`.
    pub lateness: Duration,
    /// Whether this activation moved the min/max inter-arrival bounds.
    pub bounds_changed: bool,
}

/// Drives one periodic task: computes absolute wake-ups, blocks on them,
/// and keeps the task's [`ActivationRecord`].
pub struct PeriodicScheduler<W: PeriodicWait> {
    name: String,
    period: Duration,
    boot_iter: u64,
    lag_warning: Option<Duration>,
    waiter: W,
    phase: SchedulerPhase,
    next: Instant,
    previous: Instant,
    record: ActivationRecord,
}

impl<W: PeriodicWait> PeriodicScheduler<W> {
    pub fn new(name: impl Into<String>, period: Duration, waiter: W) -> Self {
        Self {
            name: name.into(),
            period,
            boot_iter: BOOT_ITER,
            lag_warning: None,
            waiter,
            phase: SchedulerPhase::Initializing,
            next: Instant::default(),
            previous: Instant::default(),
            record: ActivationRecord::new(),
        }
    }

    /// Number of warm-up activations excluded from the inter-arrival bounds.
    pub fn with_boot_iter(mut self, boot_iter: u64) -> Self {
        self.boot_iter = boot_iter;
        self
    }

    /// Log and count activations later than `threshold`.
    pub fn with_lag_warning(mut self, threshold: Option<Duration>) -> Self {
        self.lag_warning = threshold;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    pub fn mode(&self) -> WaitMode {
        self.waiter.mode()
    }

    pub fn record(&self) -> &ActivationRecord {
        &self.record
    }

    pub fn waiter(&self) -> &W {
        &self.waiter
    }

    /// Absolute instant of the next wake-up. Meaningless before `start`.
    pub fn next_wakeup(&self) -> Instant {
        self.next
    }

    /// Anchor the schedule at the current time: `next = now + period`.
    pub fn start(&mut self) -> Result<()> {
        let now = self.waiter.now();
        self.previous = now;
        self.next = now + self.period;
        self.waiter.arm(self.next, self.period)?;
        self.record.next_wakeup = Some(self.next);
        self.phase = SchedulerPhase::Waiting;
        debug!(
            task = %self.name,
            period_us = self.period.as_micros_f64(),
            mode = ?self.waiter.mode(),
            "periodic schedule started"
        );
        Ok(())
    }

    /// Block until the next activation and account for it.
    ///
    /// Starts the schedule on first use. In overrun-counting mode a missed
    /// period moves the scheduler to `Terminated` and returns `Overrun`.
    pub fn wait_next(&mut self) -> Result<Activation> {
        if self.phase == SchedulerPhase::Initializing {
            self.start()?;
        }
        self.phase = SchedulerPhase::Waiting;

        let scheduled = self.next;
        let missed = self.waiter.wait_until(scheduled)?;
        let at = self.waiter.now();
        self.next = scheduled + self.period;
        self.record.next_wakeup = Some(self.next);

        if missed > 0 {
            self.record.record_overruns(missed);
            self.phase = SchedulerPhase::Terminated;
            error!(task = %self.name, missed, "task overrun");
            return Err(HarnessError::Overrun {
                task: self.name.clone(),
                overruns: missed,
            });
        }

        let lateness = subtract(at, scheduled);
        if self.record.record_lateness(lateness, self.lag_warning) {
            warn!(
                task = %self.name,
                lateness_us = lateness.as_micros_f64(),
                late_activations = self.record.late_activations,
                "activation behind schedule"
            );
        }

        let inter_arrival = subtract(at, self.previous);
        self.previous = at;
        let bounds_changed = self.record.observe(at, inter_arrival, self.boot_iter);
        if bounds_changed {
            if let (Some(min), Some(max)) = (self.record.min_iat, self.record.max_iat) {
                info!(
                    task = %self.name,
                    min_us = min.as_micros_f64(),
                    max_us = max.as_micros_f64(),
                    "inter-arrival time bounds"
                );
            }
        }

        Ok(Activation {
            index: self.record.activations,
            at,
            scheduled,
            inter_arrival,
            lateness,
            bounds_changed,
        })
    }

    /// Run the periodic loop, calling `work` once per activation.
    ///
    /// Returns the final activation record when the loop ends through the
    /// shutdown token or `ControlFlow::Break`.
    pub fn run<F>(&mut self, shutdown: &ShutdownToken, mut work: F) -> Result<ActivationRecord>
    where
        F: FnMut(&Activation) -> Result<ControlFlow<()>>,
    {
        let outcome = loop {
            let activation = match self.wait_next() {
                Ok(activation) => activation,
                Err(e) => break Err(e),
            };
            if shutdown.is_cancelled() {
                break Ok(());
            }

            self.phase = SchedulerPhase::Executing;
            match work(&activation) {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.phase = SchedulerPhase::Terminated;
        info!(
            task = %self.name,
            activations = self.record.activations,
            overruns = self.record.overruns,
            max_lateness_us = self.record.max_lateness.as_micros_f64(),
            "periodic loop finished"
        );
        outcome.map(|()| self.record.clone())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Deterministic clock: every wait lands on the deadline plus a scripted
    /// jitter, and reports scripted overrun counts.
    struct ScriptedWait {
        mode: WaitMode,
        now: Instant,
        jitter: VecDeque<Duration>,
        missed: VecDeque<u64>,
        deadlines: Vec<Instant>,
        armed: Option<(Instant, Duration)>,
    }

    impl ScriptedWait {
        fn new(mode: WaitMode) -> Self {
            Self {
                mode,
                now: Instant::new(1_000, 0),
                jitter: VecDeque::new(),
                missed: VecDeque::new(),
                deadlines: Vec::new(),
                armed: None,
            }
        }

        fn with_jitter(mut self, jitter: impl IntoIterator<Item = Duration>) -> Self {
            self.jitter = jitter.into_iter().collect();
            self
        }

        fn with_missed(mut self, missed: impl IntoIterator<Item = u64>) -> Self {
            self.missed = missed.into_iter().collect();
            self
        }
    }

    impl PeriodicWait for ScriptedWait {
        fn mode(&self) -> WaitMode {
            self.mode
        }

        fn now(&self) -> Instant {
            self.now
        }

        fn arm(&mut self, first: Instant, period: Duration) -> Result<()> {
            self.armed = Some((first, period));
            Ok(())
        }

        fn wait_until(&mut self, deadline: Instant) -> Result<u64> {
            self.deadlines.push(deadline);
            let base = self.now.max(deadline);
            self.now = base + self.jitter.pop_front().unwrap_or(Duration::ZERO);
            Ok(self.missed.pop_front().unwrap_or(0))
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn us(v: u64) -> Duration {
        Duration::from_micros(v)
    }

    #[test]
    fn test_deadlines_advance_by_exactly_one_period() {
        let period = ms(100);
        let waiter = ScriptedWait::new(WaitMode::AbsoluteSleep)
            .with_jitter([us(0), us(750), us(30), ms(40), us(5), us(999)]);
        let mut sched = PeriodicScheduler::new("t", period, waiter);

        let mut scheduled = Vec::new();
        for _ in 0..6 {
            scheduled.push(sched.wait_next().unwrap().scheduled);
        }

        assert_eq!(scheduled[0], Instant::new(1_000, 0) + period);
        for pair in scheduled.windows(2) {
            assert_eq!(subtract(pair[1], pair[0]), period);
        }
        assert_eq!(sched.next_wakeup(), scheduled[5] + period);
        assert_eq!(sched.waiter().deadlines, scheduled);
        assert_eq!(sched.waiter().armed, Some((scheduled[0], period)));
    }

    #[test]
    fn test_inter_arrival_reflects_jitter() {
        let waiter = ScriptedWait::new(WaitMode::AbsoluteSleep).with_jitter([us(0), us(300), us(0)]);
        let mut sched = PeriodicScheduler::new("t", ms(10), waiter);

        let a1 = sched.wait_next().unwrap();
        let a2 = sched.wait_next().unwrap();
        let a3 = sched.wait_next().unwrap();

        assert_eq!(a1.inter_arrival, ms(10));
        assert_eq!(a2.inter_arrival, ms(10) + us(300));
        assert_eq!(a2.lateness, us(300));
        assert_eq!(a3.inter_arrival, ms(10).saturating_sub(us(300)));
        assert_eq!(a3.lateness, Duration::ZERO);
    }

    #[test]
    fn test_bounds_first_updated_at_boot_iter() {
        let waiter = ScriptedWait::new(WaitMode::AbsoluteSleep);
        let mut sched = PeriodicScheduler::new("t", ms(1), waiter).with_boot_iter(10);

        let mut first_change = None;
        for _ in 0..15 {
            let act = sched.wait_next().unwrap();
            if act.bounds_changed && first_change.is_none() {
                first_change = Some(act.index);
            }
            if act.index < 10 {
                assert_eq!(sched.record().min_iat, None);
            }
        }
        assert_eq!(first_change, Some(10));
        assert_eq!(sched.record().min_iat, Some(ms(1)));
        assert_eq!(sched.record().max_iat, Some(ms(1)));
    }

    #[test]
    fn test_overrun_terminates_in_counting_mode() {
        let waiter = ScriptedWait::new(WaitMode::OverrunCounting).with_missed([0, 0, 2]);
        let mut sched = PeriodicScheduler::new("sensor", ms(5), waiter);
        let token = ShutdownToken::new();

        let mut calls = 0;
        let err = sched
            .run(&token, |_| {
                calls += 1;
                Ok(ControlFlow::Continue(()))
            })
            .unwrap_err();

        assert!(matches!(err, HarnessError::Overrun { ref task, overruns: 2 } if task == "sensor"));
        assert_eq!(calls, 2);
        assert_eq!(sched.phase(), SchedulerPhase::Terminated);
        assert_eq!(sched.record().overruns, 2);
    }

    #[test]
    fn test_plain_sleep_falls_behind_without_failing() {
        // Every wake is two periods late: the schedule keeps its grid and the
        // task never errors, it only accumulates lateness.
        let period = ms(10);
        let waiter = ScriptedWait::new(WaitMode::AbsoluteSleep).with_jitter(vec![ms(20); 8]);
        let mut sched = PeriodicScheduler::new("t", period, waiter).with_lag_warning(Some(ms(15)));

        let mut last = None;
        for _ in 0..8 {
            last = Some(sched.wait_next().unwrap());
        }
        let last = last.unwrap();

        assert_eq!(sched.phase(), SchedulerPhase::Waiting);
        assert_eq!(sched.record().overruns, 0);
        assert!(last.lateness > ms(20));
        assert_eq!(sched.record().late_activations, 8);
        assert_eq!(last.scheduled, Instant::new(1_000, 0) + period.saturating_mul(8));
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let waiter = ScriptedWait::new(WaitMode::AbsoluteSleep);
        let mut sched = PeriodicScheduler::new("t", ms(1), waiter);
        let token = ShutdownToken::new();

        let mut calls = 0;
        let record = sched
            .run(&token, |_| {
                calls += 1;
                if calls == 3 {
                    token.cancel();
                }
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();

        assert_eq!(calls, 3);
        assert_eq!(record.activations, 4);
        assert_eq!(sched.phase(), SchedulerPhase::Terminated);
    }

    #[test]
    fn test_run_stops_on_break() {
        let waiter = ScriptedWait::new(WaitMode::AbsoluteSleep);
        let mut sched = PeriodicScheduler::new("t", ms(1), waiter);

        let record = sched
            .run(&ShutdownToken::new(), |act| {
                Ok(if act.index == 5 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                })
            })
            .unwrap();
        assert_eq!(record.activations, 5);
    }

    #[test]
    fn test_run_propagates_work_error() {
        let waiter = ScriptedWait::new(WaitMode::AbsoluteSleep);
        let mut sched = PeriodicScheduler::new("t", ms(1), waiter);

        let err = sched
            .run(&ShutdownToken::new(), |_| Err(HarnessError::QueueClosed("q".into())))
            .unwrap_err();
        assert!(matches!(err, HarnessError::QueueClosed(_)));
        assert_eq!(sched.phase(), SchedulerPhase::Terminated);
    }

    #[test]
    fn test_absolute_sleep_wakes_on_grid() {
        let period = ms(2);
        let mut sched = PeriodicScheduler::new("real", period, AbsoluteSleep).with_boot_iter(0);

        let mut previous = None;
        for _ in 0..5 {
            let act = sched.wait_next().unwrap();
            assert!(act.at >= act.scheduled);
            if let Some(prev) = previous {
                assert_eq!(subtract(act.scheduled, prev), period);
            }
            previous = Some(act.scheduled);
        }
        assert!(sched.record().min_iat.is_some());
    }
}
