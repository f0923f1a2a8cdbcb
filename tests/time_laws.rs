//! Property tests for time arithmetic.
//!
//! - `subtract(add(t, d), t) == d` for non-overflowing operands
//! - `add` keeps the nanosecond field normalized
//! - `subtract` never goes negative

use proptest::prelude::*;
use rt_harness::time::{add, subtract, Duration, Instant};

const NANOS: u32 = 1_000_000_000;

fn arb_instant() -> impl Strategy<Value = Instant> {
    (0u64..1 << 40, 0u32..NANOS).prop_map(|(s, n)| Instant::new(s, n))
}

fn arb_duration() -> impl Strategy<Value = Duration> {
    (0u64..1 << 40, 0u32..NANOS).prop_map(|(s, n)| Duration::new(s, n))
}

proptest! {
    #[test]
    fn add_then_subtract_round_trips(t in arb_instant(), d in arb_duration()) {
        prop_assert_eq!(subtract(add(t, d), t), d);
    }

    #[test]
    fn add_stays_normalized(t in arb_instant(), d in arb_duration()) {
        let sum = add(t, d);
        prop_assert!(sum.nanos() < NANOS);
        prop_assert!(sum >= t);
    }

    #[test]
    fn subtract_clamps_reversed(a in arb_instant(), b in arb_instant()) {
        let d = subtract(a, b);
        if a <= b {
            prop_assert_eq!(d, Duration::ZERO);
        } else {
            prop_assert_eq!(add(b, d), a);
        }
    }
}
