//! # rt-harness
//!
//! A periodic real-time task harness for Linux.
//!
//! ## Overview
//!
//! The harness runs a small, static set of OS threads that wake at a fixed
//! period, measure their inter-arrival jitter, execute a synthetic CPU load,
//! and optionally hand data to each other through bounded queues. It is a
//! measurement tool for a machine's real-time behaviour, not a general
//! purpose scheduler: tasks are declared up front and never admitted
//! dynamically.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │              Binary (main.rs) · launch.rs              │
//! │     CLI · config · jitter / multi / pipeline modes     │
//! ├────────────────────────────────────────────────────────┤
//! │                 Runtime (runtime.rs)                   │
//! │    register() · start() · wait_for_exit() · shutdown() │
//! ├──────────────┬────────────────────┬───────────────────┤
//! │  Scheduler   │   Workload         │  Queues           │
//! │  scheduler.rs│   workload.rs      │  queue.rs         │
//! │  ─ start()   │   ─ trapezoid()    │  ─ create/bind    │
//! │  ─ wait_next │   ─ run()          │  ─ send/receive   │
//! │  ─ run()     │                    │  ─ close/unbind   │
//! ├──────────────┴────────────────────┴───────────────────┤
//! │   Pipeline (pipeline.rs): sensor → processing → storage │
//! ├────────────────────────────────────────────────────────┤
//! │   Task model (task.rs) · Time (time.rs) · sync.rs       │
//! │   TaskDescriptor · ActivationRecord · Instant/Duration  │
//! ├────────────────────────────────────────────────────────┤
//! │            OS port (arch/linux.rs)                      │
//! │   clock_nanosleep · timerfd · SCHED_FIFO · affinity    │
//! │   mlockall · sigwait                                    │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Timing Model
//!
//! Every periodic task wakes at absolute instants `start + k·period`. The
//! next deadline advances by exactly one period per activation, so wake-up
//! jitter and execution time never accumulate into drift. The first
//! `BOOT_ITER` activations are excluded from the min/max inter-arrival
//! statistics.
//!
//! Two wait modes are available and must be chosen explicitly:
//!
//! - **Absolute sleep**: no overrun detection; an overloaded task falls
//!   behind, optionally flagged by a lag threshold.
//! - **Overrun counting**: a `timerfd` reports missed periods and the first
//!   overrun terminates the task.
//!
//! ## Concurrency Model
//!
//! - One OS thread per task, optionally `SCHED_FIFO` and core-pinned
//! - Activation records are owned by their task; no locking
//! - Queues are the only shared state and encapsulate their locking
//! - Shutdown is cooperative: SIGINT/SIGTERM wake the main thread, which
//!   cancels the shutdown token, closes the queues and joins every task

pub mod arch;
pub mod config;
pub mod error;
pub mod launch;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod signal;
pub mod sync;
pub mod task;
pub mod time;
pub mod workload;

pub use error::{HarnessError, Result};
