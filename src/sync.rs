//! # Synchronization Primitives
//!
//! Cross-thread coordination that is not a message queue. Today that is a
//! single primitive: the shutdown token every task checks after each
//! wake-up. Its condvar doubles as the runtime's exit notification, so a
//! coordinator can sleep until either shutdown is requested or the work it
//! watches has finished.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct ShutdownState {
    requested: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

/// Cooperative cancellation flag shared by the runtime and its tasks.
///
/// Clones observe the same flag. Checking is a single atomic load, cheap
/// enough for the periodic hot path; [`ShutdownToken::wait`] blocks without
/// spinning for coordinators that have nothing else to do.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    state: Arc<ShutdownState>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake every waiter. Idempotent.
    pub fn cancel(&self) {
        let _guard = self.state.lock.lock();
        self.state.requested.store(true, Ordering::SeqCst);
        self.state.cond.notify_all();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    /// Block until [`ShutdownToken::cancel`] has been called.
    pub fn wait(&self) {
        let mut guard = self.state.lock.lock();
        while !self.is_cancelled() {
            self.state.cond.wait(&mut guard);
        }
    }

    /// Wake every waiter without requesting shutdown, so they re-check
    /// their condition.
    pub fn notify(&self) {
        let _guard = self.state.lock.lock();
        self.state.cond.notify_all();
    }

    /// Block until cancelled or `done` holds. Returns true if cancelled.
    ///
    /// `done` is evaluated under the token's lock; whoever makes it true
    /// must call [`ShutdownToken::notify`] afterwards.
    pub fn wait_until(&self, mut done: impl FnMut() -> bool) -> bool {
        let mut guard = self.state.lock.lock();
        while !self.is_cancelled() && !done() {
            self.state.cond.wait(&mut guard);
        }
        self.is_cancelled()
    }

    /// Block until cancelled or `timeout` elapses. Returns true if cancelled.
    pub fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.state.lock.lock();
        while !self.is_cancelled() {
            if self.state.cond.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_cancelled()
    }
}
