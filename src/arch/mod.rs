//! # Architecture Abstraction Layer
//!
//! OS boundary of the harness. Everything above this module speaks in
//! `time::Instant`/`time::Duration` and `HarnessError`; everything that
//! touches libc lives below it.

pub mod linux;
