//! Monotonic timestamp repair.
//!
//! Hardware encoders occasionally report a timestamp equal to or earlier than
//! the previous one. Containers reject that, so every emitted timestamp is
//! forced to be strictly greater than the last: `ts <= last` becomes `last + 1`.
//! Presentation and decode timestamps are tracked independently.

/// Tracks the last emitted value of one timestamp series.
#[derive(Clone, Debug, Default)]
pub struct MonotonicTimestamps {
    last: Option<i64>,
    repaired: u64,
}

impl MonotonicTimestamps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `ts`, bumped to `last + 1` when it would not advance the series.
    pub fn repair(&mut self, ts: i64) -> i64 {
        let out = match self.last {
            Some(last) if ts <= last => {
                self.repaired += 1;
                last + 1
            }
            _ => ts,
        };
        self.last = Some(out);
        out
    }

    /// Forget history; the next value is accepted as-is.
    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn last(&self) -> Option<i64> {
        self.last
    }

    /// Number of values that had to be bumped.
    pub fn repaired_count(&self) -> u64 {
        self.repaired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn repairs_equal_and_backwards_values() {
        let mut ts = MonotonicTimestamps::new();
        let out: Vec<i64> = [100, 100, 99, 150].iter().map(|&t| ts.repair(t)).collect();
        assert_eq!(out, vec![100, 101, 102, 150]);
        assert_eq!(ts.repaired_count(), 2);
    }

    #[test]
    fn first_value_is_untouched() {
        let mut ts = MonotonicTimestamps::new();
        assert_eq!(ts.repair(-5), -5);
        assert_eq!(ts.last(), Some(-5));
    }

    #[test]
    fn reset_accepts_earlier_value() {
        let mut ts = MonotonicTimestamps::new();
        ts.repair(1_000);
        ts.reset();
        assert_eq!(ts.repair(0), 0);
    }

    proptest! {
        #[test]
        fn output_is_strictly_increasing(input in proptest::collection::vec(-1_000i64..1_000, 1..64)) {
            let mut ts = MonotonicTimestamps::new();
            let out: Vec<i64> = input.iter().map(|&t| ts.repair(t)).collect();
            for pair in out.windows(2) {
                prop_assert!(pair[1] > pair[0]);
            }
            for (i, o) in input.iter().zip(&out) {
                prop_assert!(o >= i);
            }
        }
    }
}
