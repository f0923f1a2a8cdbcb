//! # Time Arithmetic
//!
//! Seconds+nanoseconds time values in the monotonic clock domain, and the
//! two operations the periodic loop is built on:
//!
//! - [`add`]: `Instant + Duration`, carrying nanosecond overflow into seconds
//! - [`subtract`]: `Instant - Instant`, clamped to zero when the operands
//!   are reversed
//!
//! Both types keep `nanos` in `[0, NS_IN_SEC)`. The representation mirrors
//! `struct timespec` so values cross the libc boundary without rounding.

use std::fmt;

use crate::config::NS_IN_SEC;

// ---------------------------------------------------------------------------
// Instant
// ---------------------------------------------------------------------------

/// An absolute point on the monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Instant {
    secs: u64,
    nanos: u32,
}

impl Instant {
    /// Build an instant, normalizing `nanos` overflow into `secs`.
    pub const fn new(secs: u64, nanos: u32) -> Self {
        Self {
            secs: secs + (nanos / NS_IN_SEC) as u64,
            nanos: nanos % NS_IN_SEC,
        }
    }

    /// Current value of `CLOCK_MONOTONIC`.
    pub fn now() -> Self {
        crate::arch::linux::monotonic_now()
    }

    #[inline]
    pub const fn secs(&self) -> u64 {
        self.secs
    }

    #[inline]
    pub const fn nanos(&self) -> u32 {
        self.nanos
    }

    /// Time elapsed from `earlier` to `self`, or `None` if `earlier` is
    /// later than `self`. Use this instead of [`subtract`] when a reversed
    /// ordering must be detected.
    pub fn checked_duration_since(&self, earlier: Instant) -> Option<Duration> {
        if *self < earlier {
            None
        } else {
            Some(subtract(*self, earlier))
        }
    }

    pub fn to_timespec(self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.secs as libc::time_t,
            tv_nsec: self.nanos as libc::c_long,
        }
    }

    /// Convert a kernel timespec. Negative fields are clamped to zero.
    pub fn from_timespec(ts: libc::timespec) -> Self {
        Self::new(ts.tv_sec.max(0) as u64, ts.tv_nsec.max(0) as u32)
    }
}

impl std::ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        add(self, rhs)
    }
}

impl std::ops::AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        *self = add(*self, rhs);
    }
}

// ---------------------------------------------------------------------------
// Duration
// ---------------------------------------------------------------------------

/// A non-negative time span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration {
    secs: u64,
    nanos: u32,
}

impl Duration {
    pub const ZERO: Duration = Duration { secs: 0, nanos: 0 };

    /// Build a duration, normalizing `nanos` overflow into `secs`.
    pub const fn new(secs: u64, nanos: u32) -> Self {
        Self {
            secs: secs + (nanos / NS_IN_SEC) as u64,
            nanos: nanos % NS_IN_SEC,
        }
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        Self {
            secs: nanos / NS_IN_SEC as u64,
            nanos: (nanos % NS_IN_SEC as u64) as u32,
        }
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self::new(micros / 1_000_000, ((micros % 1_000_000) * 1_000) as u32)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self::new(millis / 1_000, ((millis % 1_000) * 1_000_000) as u32)
    }

    #[inline]
    pub const fn secs(&self) -> u64 {
        self.secs
    }

    #[inline]
    pub const fn subsec_nanos(&self) -> u32 {
        self.nanos
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.secs == 0 && self.nanos == 0
    }

    pub const fn as_nanos(&self) -> u128 {
        self.secs as u128 * NS_IN_SEC as u128 + self.nanos as u128
    }

    /// Microseconds with fractional part, for log output.
    pub fn as_micros_f64(&self) -> f64 {
        self.secs as f64 * 1e6 + self.nanos as f64 / 1e3
    }

    /// Milliseconds with fractional part, for log output.
    pub fn as_millis_f64(&self) -> f64 {
        self.secs as f64 * 1e3 + self.nanos as f64 / 1e6
    }

    /// `self - rhs`, clamped to zero.
    pub fn saturating_sub(self, rhs: Duration) -> Duration {
        subtract(Instant::new(self.secs, self.nanos), Instant::new(rhs.secs, rhs.nanos))
    }

    /// Multiply by an integer count, saturating at the largest duration.
    pub fn saturating_mul(self, count: u64) -> Duration {
        let total = self.as_nanos().saturating_mul(count as u128);
        let secs = total / NS_IN_SEC as u128;
        if secs > u64::MAX as u128 {
            return Duration::new(u64::MAX, NS_IN_SEC - 1);
        }
        Duration::new(secs as u64, (total % NS_IN_SEC as u128) as u32)
    }
}

impl std::ops::Add for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Duration {
        Duration::new(self.secs + rhs.secs, self.nanos + rhs.nanos)
    }
}

impl From<std::time::Duration> for Duration {
    fn from(d: std::time::Duration) -> Self {
        Self::new(d.as_secs(), d.subsec_nanos())
    }
}

impl From<Duration> for std::time::Duration {
    fn from(d: Duration) -> Self {
        std::time::Duration::new(d.secs, d.nanos)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}us", self.as_micros_f64())
    }
}

// ---------------------------------------------------------------------------
// Arithmetic
// ---------------------------------------------------------------------------

/// `a + b`, carrying nanosecond overflow into the seconds field.
pub fn add(a: Instant, b: Duration) -> Instant {
    let mut secs = a.secs + b.secs;
    let mut nanos = a.nanos + b.nanos;
    if nanos >= NS_IN_SEC {
        secs += 1;
        nanos -= NS_IN_SEC;
    }
    Instant { secs, nanos }
}

/// `a - b`. Returns a zero duration when `a <= b`.
///
/// The clamp hides misordered operands; callers that must tell the
/// difference compare first or use [`Instant::checked_duration_since`].
pub fn subtract(a: Instant, b: Instant) -> Duration {
    if a <= b {
        return Duration::ZERO;
    }
    let mut secs = a.secs - b.secs;
    let nanos = if a.nanos < b.nanos {
        secs -= 1;
        a.nanos + NS_IN_SEC - b.nanos
    } else {
        a.nanos - b.nanos
    };
    Duration { secs, nanos }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_carries_nanoseconds() {
        let t = Instant::new(5, 900_000_000);
        let r = add(t, Duration::new(0, 200_000_000));
        assert_eq!(r, Instant::new(6, 100_000_000));
        assert!(r.nanos() < NS_IN_SEC);
    }

    #[test]
    fn test_add_exact_second_boundary() {
        let r = add(Instant::new(1, 500_000_000), Duration::new(0, 500_000_000));
        assert_eq!(r.secs(), 2);
        assert_eq!(r.nanos(), 0);
    }

    #[test]
    fn test_subtract_borrows() {
        let d = subtract(Instant::new(10, 100), Instant::new(8, 200));
        assert_eq!(d, Duration::new(1, NS_IN_SEC - 100));
    }

    #[test]
    fn test_subtract_clamps_reversed_operands() {
        let early = Instant::new(3, 0);
        let late = Instant::new(4, 0);
        assert_eq!(subtract(early, late), Duration::ZERO);
        assert_eq!(subtract(late, late), Duration::ZERO);
        assert_eq!(early.checked_duration_since(late), None);
        assert_eq!(late.checked_duration_since(early), Some(Duration::new(1, 0)));
    }

    #[test]
    fn test_constructors_normalize() {
        assert_eq!(Instant::new(0, 2_500_000_000), Instant::new(2, 500_000_000));
        assert_eq!(Duration::from_millis(1_250), Duration::new(1, 250_000_000));
        assert_eq!(Duration::from_micros(1_000_001), Duration::new(1, 1_000));
        assert_eq!(Duration::from_nanos(3_000_000_007), Duration::new(3, 7));
    }

    #[test]
    fn test_saturating_mul() {
        assert_eq!(
            Duration::from_millis(300).saturating_mul(4),
            Duration::new(1, 200_000_000)
        );
        assert_eq!(Duration::from_millis(300).saturating_mul(0), Duration::ZERO);
    }

    #[test]
    fn test_std_duration_conversion() {
        let std = std::time::Duration::from_micros(1_500);
        let d: Duration = std.into();
        assert_eq!(d, Duration::from_micros(1_500));
        assert_eq!(std::time::Duration::from(d), std);
    }

    #[test]
    fn test_now_is_monotonic() {
        let a = Instant::now();
        let b = Instant::now();
        assert!(b >= a);
    }
}
