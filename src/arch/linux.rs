//! # Linux Port Layer
//!
//! Thin wrappers over the POSIX/Linux calls the harness depends on:
//!
//! - **Clock**: `clock_gettime(CLOCK_MONOTONIC)`
//! - **Absolute sleep**: `clock_nanosleep(CLOCK_MONOTONIC, TIMER_ABSTIME)`
//! - **Periodic timer**: `timerfd` armed with an absolute first expiry and
//!   an interval; each `read` returns the number of expirations since the
//!   previous read, which is the overrun count the kernel keeps for us
//! - **Scheduling**: `pthread_setschedparam(SCHED_FIFO)`, `sched_setaffinity`,
//!   `sched_getaffinity`
//! - **Memory**: `mlockall(MCL_CURRENT | MCL_FUTURE)`
//! - **Termination signals**: SIGINT/SIGTERM blocked with `pthread_sigmask`
//!   and consumed synchronously with `sigwait`
//!
//! Every call that reports failure is surfaced as `HarnessError::Os` with
//! the kernel's error text. Interrupted sleeps and reads are restarted;
//! the absolute deadlines make restarts drift-free.

use std::collections::BTreeSet;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use crate::error::{HarnessError, Result};
use crate::signal::Signal;
use crate::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Read `CLOCK_MONOTONIC`.
pub fn monotonic_now() -> Instant {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC is always available on Linux; the call only fails
    // for an invalid clock id or pointer.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    debug_assert_eq!(rc, 0, "clock_gettime(CLOCK_MONOTONIC) failed");
    Instant::from_timespec(ts)
}

/// Block the calling thread until `deadline` on the monotonic clock.
///
/// Returns immediately if the deadline is already in the past. The kernel
/// gives no indication of how late the caller was.
pub fn sleep_until(deadline: Instant) -> Result<()> {
    let ts = deadline.to_timespec();
    loop {
        let rc = unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &ts,
                std::ptr::null_mut(),
            )
        };
        match rc {
            0 => return Ok(()),
            libc::EINTR => continue,
            errno => return Err(HarnessError::from_errno("clock_nanosleep", errno)),
        }
    }
}

// ---------------------------------------------------------------------------
// Periodic timer
// ---------------------------------------------------------------------------

/// A monotonic `timerfd` driving one periodic task.
#[derive(Debug)]
pub struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC) };
        if fd < 0 {
            return Err(HarnessError::last_os_error("timerfd_create"));
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Arm the timer: first expiry at `first` (absolute), then every `period`.
    pub fn arm(&self, first: Instant, period: Duration) -> Result<()> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: period.secs() as libc::time_t,
                tv_nsec: period.subsec_nanos() as libc::c_long,
            },
            it_value: first.to_timespec(),
        };
        let rc = unsafe {
            libc::timerfd_settime(
                self.fd.as_raw_fd(),
                libc::TFD_TIMER_ABSTIME,
                &spec,
                std::ptr::null_mut(),
            )
        };
        if rc != 0 {
            return Err(HarnessError::last_os_error("timerfd_settime"));
        }
        Ok(())
    }

    /// Block until the next expiry. Returns the number of expirations since
    /// the previous call; anything above 1 means periods were missed.
    pub fn wait(&self) -> Result<u64> {
        let mut expirations: u64 = 0;
        loop {
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    (&mut expirations as *mut u64).cast::<libc::c_void>(),
                    std::mem::size_of::<u64>(),
                )
            };
            if n == std::mem::size_of::<u64>() as isize {
                return Ok(expirations);
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(HarnessError::Os {
                call: "read(timerfd)",
                source: err,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduling policy and affinity
// ---------------------------------------------------------------------------

/// Put the calling thread under `SCHED_FIFO` at `priority`.
pub fn set_fifo_priority(priority: u8) -> Result<()> {
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = priority as libc::c_int;
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc != 0 {
        return Err(HarnessError::from_errno("pthread_setschedparam", rc));
    }
    Ok(())
}

/// Restrict the calling thread to the given cores.
pub fn set_affinity(cores: impl IntoIterator<Item = usize>) -> Result<()> {
    let mut set = unsafe { MaybeUninit::<libc::cpu_set_t>::zeroed().assume_init() };
    unsafe { libc::CPU_ZERO(&mut set) };
    for core in cores {
        if core >= libc::CPU_SETSIZE as usize {
            return Err(HarnessError::from_errno("sched_setaffinity", libc::EINVAL));
        }
        unsafe { libc::CPU_SET(core, &mut set) };
    }
    let rc = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) };
    if rc != 0 {
        return Err(HarnessError::last_os_error("sched_setaffinity"));
    }
    Ok(())
}

/// Cores the calling thread may run on, as the kernel reports them.
///
/// Core ids need not be contiguous: offline cores and cpuset limits leave
/// holes in the set.
pub fn allowed_cpus() -> Result<BTreeSet<usize>> {
    let mut set = unsafe { MaybeUninit::<libc::cpu_set_t>::zeroed().assume_init() };
    let rc = unsafe { libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) };
    if rc != 0 {
        return Err(HarnessError::last_os_error("sched_getaffinity"));
    }
    Ok((0..libc::CPU_SETSIZE as usize)
        .filter(|&core| unsafe { libc::CPU_ISSET(core, &set) })
        .collect())
}

/// Lock current and future pages in RAM to keep page faults out of the
/// periodic path.
pub fn lock_memory() -> Result<()> {
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if rc != 0 {
        return Err(HarnessError::last_os_error("mlockall"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Termination signals
// ---------------------------------------------------------------------------

/// SIGINT and SIGTERM, blocked for asynchronous delivery.
///
/// Threads inherit the signal mask of their creator, so blocking in the
/// main thread before any task is spawned routes both signals to
/// [`TerminationSignals::wait`].
pub struct TerminationSignals {
    set: libc::sigset_t,
}

impl TerminationSignals {
    /// Block SIGINT and SIGTERM in the calling thread.
    pub fn block() -> Result<Self> {
        let mut set = unsafe { MaybeUninit::<libc::sigset_t>::zeroed().assume_init() };
        unsafe {
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGINT);
            libc::sigaddset(&mut set, libc::SIGTERM);
        }
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(HarnessError::from_errno("pthread_sigmask", rc));
        }
        Ok(Self { set })
    }

    /// Block until SIGINT or SIGTERM is pending, and consume it.
    pub fn wait(&self) -> Result<Signal> {
        loop {
            let mut signo: libc::c_int = 0;
            let rc = unsafe { libc::sigwait(&self.set, &mut signo) };
            if rc != 0 {
                return Err(HarnessError::from_errno("sigwait", rc));
            }
            if let Some(signal) = Signal::from_number(signo) {
                return Ok(signal);
            }
        }
    }
}
