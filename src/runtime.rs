//! # Runtime
//!
//! Task registry and lifecycle: register descriptors, start each one on its
//! own OS thread, and tear everything down on shutdown.
//!
//! ## Startup Sequence
//!
//! ```text
//! main()
//!   ├─► TerminationSignals::block()   ← before any thread exists
//!   ├─► Runtime::register()  (×N)    ← DuplicateName / ResourceExhausted
//!   ├─► Runtime::start()     (×N)
//!   │     ├─► validate priority range and affinity
//!   │     ├─► spawn named thread
//!   │     │     ├─► apply SCHED_FIFO priority, pin cores
//!   │     │     └─► report back over the ready channel
//!   │     └─► Ok, or Start error with the OS reason
//!   ├─► Runtime::wait_for_exit()      ← main sleeps here until every
//!   │                                   task returns or the signal
//!   │                                   thread cancels the token
//!   └─► Runtime::shutdown()           ← on cancellation
//!         ├─► cancel the shutdown token
//!         ├─► close every queue
//!         └─► join every thread → Terminated
//! ```
//!
//! The runtime is the only owner of the task table. Tasks see the outside
//! world through a [`TaskContext`]: their name and period, the shutdown
//! token and the queue namespace.

use std::thread::{self, JoinHandle};

use crossbeam_channel::bounded;
use tracing::{debug, error, info, info_span, warn};

use crate::arch::linux;
use crate::config::{MAX_RT_PRIORITY, MAX_TASKS, MIN_RT_PRIORITY};
use crate::error::{HarnessError, NameKind, Result};
use crate::queue::QueueRegistry;
use crate::sync::ShutdownToken;
use crate::task::{SchedPolicy, SharedTaskState, TaskDescriptor, TaskState};
use crate::time::Duration;

/// Opaque reference to a registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(usize);

impl TaskHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// What a task body gets to see of the runtime.
#[derive(Debug, Clone)]
pub struct TaskContext {
    name: String,
    period: Duration,
    shutdown: ShutdownToken,
    queues: QueueRegistry,
}

impl TaskContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn shutdown(&self) -> &ShutdownToken {
        &self.shutdown
    }

    pub fn queues(&self) -> &QueueRegistry {
        &self.queues
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Exit status of one task, collected at join.
#[derive(Debug)]
pub struct TaskReport {
    pub name: String,
    pub result: Result<()>,
}

struct TaskControlBlock {
    descriptor: TaskDescriptor,
    state: SharedTaskState,
    thread: Option<JoinHandle<Result<()>>>,
}

/// Owner of the task table, the queue namespace and the shutdown token.
pub struct Runtime {
    process: String,
    tasks: Vec<TaskControlBlock>,
    queues: QueueRegistry,
    shutdown: ShutdownToken,
}

impl Runtime {
    /// Create an empty runtime. `process` labels every task's log lines.
    pub fn new(process: impl Into<String>) -> Self {
        Self {
            process: process.into(),
            tasks: Vec::with_capacity(MAX_TASKS),
            queues: QueueRegistry::new(),
            shutdown: ShutdownToken::new(),
        }
    }

    pub fn process(&self) -> &str {
        &self.process
    }

    pub fn queues(&self) -> &QueueRegistry {
        &self.queues
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Add a task to the table in the `Created` state.
    pub fn register(&mut self, descriptor: TaskDescriptor) -> Result<TaskHandle> {
        if self.tasks.iter().any(|t| t.descriptor.name == descriptor.name) {
            return Err(HarnessError::DuplicateName {
                kind: NameKind::Task,
                name: descriptor.name,
            });
        }
        if self.tasks.len() >= MAX_TASKS {
            return Err(HarnessError::ResourceExhausted(format!(
                "task table full ({MAX_TASKS} tasks), cannot register {}",
                descriptor.name
            )));
        }

        debug!(
            task = %descriptor.name,
            priority = descriptor.priority,
            policy = ?descriptor.policy,
            "task registered"
        );
        self.tasks.push(TaskControlBlock {
            descriptor,
            state: SharedTaskState::new(),
            thread: None,
        });
        Ok(TaskHandle(self.tasks.len() - 1))
    }

    pub fn descriptor(&self, handle: TaskHandle) -> Option<&TaskDescriptor> {
        self.tasks.get(handle.0).map(|t| &t.descriptor)
    }

    pub fn state(&self, handle: TaskHandle) -> Option<TaskState> {
        self.tasks.get(handle.0).map(|t| t.state.get())
    }

    /// Spawn the task's thread and run `entry` on it.
    ///
    /// Scheduling policy and affinity are applied inside the new thread
    /// before `entry` runs; `start` only returns once they succeeded or
    /// failed. On failure the task stays `Created`.
    pub fn start<F>(&mut self, handle: TaskHandle, entry: F) -> Result<()>
    where
        F: FnOnce(TaskContext) -> Result<()> + Send + 'static,
    {
        let Some(tcb) = self.tasks.get_mut(handle.0) else {
            return Err(HarnessError::Start {
                task: format!("#{}", handle.0),
                reason: "unknown task handle".into(),
            });
        };
        let name = tcb.descriptor.name.clone();
        let start_error = |reason: String| HarnessError::Start {
            task: name.clone(),
            reason,
        };

        if tcb.thread.is_some() || tcb.state.get() != TaskState::Created {
            return Err(start_error("already started".into()));
        }
        if !tcb.descriptor.priority_in_range() {
            return Err(start_error(format!(
                "priority {} outside real-time range {MIN_RT_PRIORITY}..={MAX_RT_PRIORITY}",
                tcb.descriptor.priority
            )));
        }
        if tcb.descriptor.affinity.is_pinned() {
            let allowed = linux::allowed_cpus().map_err(|e| start_error(e.to_string()))?;
            if let Some(core) = tcb.descriptor.affinity.cores().find(|c| !allowed.contains(c)) {
                return Err(start_error(format!(
                    "affinity names core {core}, not in the process's allowed CPU set"
                )));
            }
        }

        let descriptor = tcb.descriptor.clone();
        let state = tcb.state.clone();
        let context = TaskContext {
            name: name.clone(),
            period: descriptor.period,
            shutdown: self.shutdown.clone(),
            queues: self.queues.clone(),
        };
        let process = self.process.clone();
        let (ready_tx, ready_rx) = bounded::<std::result::Result<(), String>>(1);

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let span = info_span!("task", process = %process, name = %descriptor.name);
                let _enter = span.enter();

                if let Err(e) = configure_current_thread(&descriptor) {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return Err(e);
                }
                state.set(TaskState::Running);
                let _exit = ExitGuard {
                    state,
                    shutdown: context.shutdown.clone(),
                };
                let _ = ready_tx.send(Ok(()));
                drop(ready_tx);

                let result = entry(context);
                match &result {
                    Ok(()) => info!("task finished"),
                    Err(e) => error!(error = %e, "task failed"),
                }
                result
            })
            .map_err(|e| start_error(format!("thread spawn failed: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                tcb.thread = Some(thread);
                info!(
                    task = %name,
                    priority = tcb.descriptor.priority,
                    policy = ?tcb.descriptor.policy,
                    period_ms = tcb.descriptor.period.as_millis_f64(),
                    "task started"
                );
                Ok(())
            }
            Ok(Err(reason)) => {
                let _ = thread.join();
                Err(start_error(reason))
            }
            Err(_) => {
                let _ = thread.join();
                Err(start_error("task thread exited during setup".into()))
            }
        }
    }

    /// Wait for every started task to return on its own.
    pub fn join_all(&mut self) -> Vec<TaskReport> {
        let mut reports = Vec::new();
        for tcb in &mut self.tasks {
            let Some(thread) = tcb.thread.take() else {
                continue;
            };
            let name = tcb.descriptor.name.clone();
            let result = match thread.join() {
                Ok(result) => result,
                Err(_) => {
                    warn!(task = %name, "task panicked");
                    Err(HarnessError::Panicked(name.clone()))
                }
            };
            tcb.state.set(TaskState::Terminated);
            reports.push(TaskReport { name, result });
        }
        reports
    }

    /// Block until every started task has returned on its own or shutdown
    /// has been requested, then collect the reports.
    ///
    /// On cancellation this goes through [`Runtime::shutdown`], so tasks
    /// blocked on a queue are woken instead of joined in place.
    pub fn wait_for_exit(&mut self) -> Vec<TaskReport> {
        let started: Vec<SharedTaskState> = self
            .tasks
            .iter()
            .filter(|t| t.thread.is_some())
            .map(|t| t.state.clone())
            .collect();
        let cancelled = self
            .shutdown
            .wait_until(|| started.iter().all(|s| s.get() == TaskState::Terminated));
        if cancelled {
            self.shutdown()
        } else {
            debug!(tasks = started.len(), "every task returned");
            self.join_all()
        }
    }

    /// Cancel every task, wake those blocked on queues and join them all.
    pub fn shutdown(&mut self) -> Vec<TaskReport> {
        info!(tasks = self.tasks.len(), "shutting down");
        self.shutdown.cancel();
        self.queues.close_all();
        let reports = self.join_all();
        debug!(joined = reports.len(), "all tasks joined");
        reports
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.tasks.iter().any(|t| t.thread.is_some()) {
            self.shutdown();
        }
    }
}

/// Marks a task `Terminated` and wakes [`Runtime::wait_for_exit`] when its
/// thread leaves the entry, panics included.
struct ExitGuard {
    state: SharedTaskState,
    shutdown: ShutdownToken,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.state.set(TaskState::Terminated);
        self.shutdown.notify();
    }
}

/// Apply the descriptor's scheduling policy and affinity to the calling
/// thread.
fn configure_current_thread(descriptor: &TaskDescriptor) -> Result<()> {
    if descriptor.policy == SchedPolicy::Fifo {
        linux::set_fifo_priority(descriptor.priority)?;
    }
    if descriptor.affinity.is_pinned() {
        linux::set_affinity(descriptor.affinity.cores())?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
