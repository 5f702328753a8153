//! Depletion time of a funded receiver list.
//!
//! `spent(t)` is the amount all streams pay out over `[now, t)`. It never
//! decreases, so the time the balance runs out is the last `t` with
//! `spent(t) <= balance`. The search sweeps the stream starts and ends left to
//! right until it finds the interval in which the balance is exhausted. Within
//! that interval the aggregate rate is constant, which gives a closed-form
//! first guess that a short bisection then corrects for per-cycle rounding.

use crate::math::{streamed_amt, AMT_PER_SEC_MULTIPLIER};
use crate::receivers::{ActiveStream, ActiveStreams, MAX_STREAMS_RECEIVERS};

const MAX_BREAKPOINTS: usize = 2 * MAX_STREAMS_RECEIVERS as usize;

/// Time at which `balance` is depleted by `streams` configured at `now`.
///
/// Returns `now` when nothing is streamed, and the latest stream end when the
/// balance outlasts every stream. The hints only narrow the search: a hint
/// equal to the result is confirmed with two balance checks, any other hint
/// leaves the result unchanged.
pub(crate) fn calc_max_end(
    balance: u128,
    streams: &ActiveStreams,
    now: u32,
    cycle_secs: u32,
    hint1: u32,
    hint2: u32,
) -> u32 {
    if streams.is_empty() || balance == 0 {
        return now;
    }
    let solver = Solver {
        streams: streams.as_slice(),
        balance,
        cycle_secs,
    };
    if solver.is_enough(u32::MAX) {
        return solver.streams.iter().map(|s| s.end).max().unwrap_or(now);
    }

    let mut enough_end = now;
    let mut not_enough_end = u32::MAX;
    for hint in [hint1, hint2] {
        if hint <= enough_end || hint >= not_enough_end {
            continue;
        }
        if !solver.is_enough(hint) {
            not_enough_end = hint;
        } else if !solver.is_enough(hint + 1) {
            return hint;
        } else {
            enough_end = hint + 1;
        }
    }
    solver.sweep(enough_end, not_enough_end)
}

struct Solver<'a> {
    streams: &'a [ActiveStream],
    balance: u128,
    cycle_secs: u32,
}

impl Solver<'_> {
    fn spent(&self, end: u32) -> u128 {
        self.streams
            .iter()
            .filter(|s| s.start < end)
            .map(|s| streamed_amt(s.amt_per_sec, s.start, s.end.min(end), self.cycle_secs))
            .sum()
    }

    fn is_enough(&self, end: u32) -> bool {
        self.spent(end) <= self.balance
    }

    /// Last enough timestamp in `[enough_end, not_enough_end)`.
    fn sweep(&self, mut enough_end: u32, not_enough_end: u32) -> u32 {
        let mut points = [0u32; MAX_BREAKPOINTS];
        let mut len = 0;
        for stream in self.streams {
            for point in [stream.start, stream.end] {
                if point > enough_end && point < not_enough_end {
                    points[len] = point;
                    len += 1;
                }
            }
        }
        let points = &mut points[..len];
        points.sort_unstable();

        let mut upper = not_enough_end;
        for &point in points.iter() {
            if point <= enough_end {
                continue;
            }
            if self.is_enough(point) {
                enough_end = point;
            } else {
                upper = point;
                break;
            }
        }
        self.search_interval(enough_end, upper)
    }

    /// No stream starts or ends strictly inside `(lo, hi)`, `lo` is enough and
    /// `hi` is not.
    fn search_interval(&self, mut lo: u32, mut hi: u32) -> u32 {
        let rate = self
            .streams
            .iter()
            .filter(|s| s.start <= lo && s.end > lo)
            .fold(0u128, |acc, s| acc.saturating_add(s.amt_per_sec));
        let remaining = self.balance - self.spent(lo);
        let guess_secs = match remaining.checked_mul(AMT_PER_SEC_MULTIPLIER) {
            Some(scaled) if rate > 0 => scaled / rate,
            _ => u128::MAX,
        };
        let guess = (lo as u128 + guess_secs).min(hi as u128 - 1) as u32;
        for probe in [guess, guess.saturating_add(1)] {
            if probe <= lo || probe >= hi {
                continue;
            }
            if self.is_enough(probe) {
                lo = probe;
            } else {
                hi = probe;
            }
        }
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if self.is_enough(mid) {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        lo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ONE: u128 = AMT_PER_SEC_MULTIPLIER;

    fn streams(items: &[(u128, u32, u32)]) -> ActiveStreams {
        let mut streams = ActiveStreams::new();
        for &(amt_per_sec, start, end) in items {
            streams.push(ActiveStream {
                amt_per_sec,
                start,
                end,
            });
        }
        streams
    }

    #[test]
    fn nothing_to_stream_ends_now() {
        assert_eq!(calc_max_end(100, &streams(&[]), 50, 10, 0, 0), 50);
        assert_eq!(
            calc_max_end(0, &streams(&[(ONE, 50, u32::MAX)]), 50, 10, 0, 0),
            50
        );
    }

    #[test]
    fn single_stream_runs_for_balance_seconds() {
        let s = streams(&[(ONE, 100, u32::MAX)]);
        assert_eq!(calc_max_end(100, &s, 100, 10, 0, 0), 200);
        assert_eq!(calc_max_end(1, &s, 100, 10, 0, 0), 101);
    }

    #[test]
    fn fractional_rates_deplete_at_cycle_offsets() {
        let rate = ONE / 4 + 1;
        let s = streams(&[(rate, 100, u32::MAX), (rate, 100, u32::MAX)]);
        // 25 cycles pay 100, the next unit would be due at offset 4
        assert_eq!(calc_max_end(100, &s, 100, 10, 0, 0), 353);
    }

    #[test]
    fn depletion_is_shared_between_receivers() {
        let s = streams(&[(ONE, 100, u32::MAX), (ONE, 105, u32::MAX)]);
        assert_eq!(calc_max_end(4, &s, 100, 10, 0, 0), 104);
        assert_eq!(calc_max_end(7, &s, 100, 10, 0, 0), 106);
    }

    #[test]
    fn balance_outlasting_bounded_streams_ends_with_the_last_one() {
        let s = streams(&[(ONE, 100, 130), (ONE * 2, 110, 120)]);
        assert_eq!(calc_max_end(1_000, &s, 100, 10, 0, 0), 130);
        // exactly enough
        assert_eq!(calc_max_end(50, &s, 100, 10, 0, 0), 130);
        // one short: the last second of the longer stream is not covered
        assert_eq!(calc_max_end(49, &s, 100, 10, 0, 0), 129);
    }

    #[test]
    fn unbounded_stream_with_huge_balance_never_ends() {
        let s = streams(&[(ONE, 100, u32::MAX)]);
        assert_eq!(calc_max_end(u128::MAX >> 1, &s, 100, 10, 0, 0), u32::MAX);
    }

    #[test]
    fn gaps_between_streams_are_skipped() {
        let s = streams(&[(ONE, 100, 110), (ONE, 200, u32::MAX)]);
        assert_eq!(calc_max_end(15, &s, 100, 10, 0, 0), 205);
        assert_eq!(calc_max_end(10, &s, 100, 10, 0, 0), 200);
    }

    #[test]
    fn correct_and_wrong_hints_give_the_same_answer() {
        let s = streams(&[(ONE, 100, u32::MAX), (ONE * 3, 150, 400)]);
        let expected = calc_max_end(1_000, &s, 100, 10, 0, 0);
        for hint in [1, 99, 100, 101, 250, expected - 1, expected, expected + 1, u32::MAX] {
            assert_eq!(calc_max_end(1_000, &s, 100, 10, hint, 0), expected);
            assert_eq!(calc_max_end(1_000, &s, 100, 10, 0, hint), expected);
            assert_eq!(calc_max_end(1_000, &s, 100, 10, hint, expected), expected);
            assert_eq!(calc_max_end(1_000, &s, 100, 10, expected + 7, hint), expected);
        }
    }

    fn arb_streams() -> impl Strategy<Value = std::vec::Vec<(u128, u32, u32)>> {
        prop::collection::vec(
            (ONE / 10..ONE * 50, 1_000u32..2_000, prop::option::of(1u32..3_000)),
            1..6,
        )
        .prop_map(|items| {
            items
                .into_iter()
                .map(|(rate, start, duration)| {
                    let end = duration.map_or(u32::MAX, |d| start + d);
                    (rate, start, end)
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn hints_never_change_the_result(
            items in arb_streams(),
            balance in 0u128..200_000,
            hint1 in any::<u32>(),
            hint2 in 0u32..6_000,
        ) {
            let s = streams(&items);
            let now = 1_000;
            let expected = calc_max_end(balance, &s, now, 7, 0, 0);
            prop_assert_eq!(calc_max_end(balance, &s, now, 7, hint1, hint2), expected);
            prop_assert_eq!(calc_max_end(balance, &s, now, 7, hint2, hint1), expected);
            prop_assert_eq!(calc_max_end(balance, &s, now, 7, expected, hint1), expected);
        }

        #[test]
        fn result_is_the_last_affordable_second(
            items in arb_streams(),
            balance in 1u128..200_000,
        ) {
            let s = streams(&items);
            let solver = Solver { streams: s.as_slice(), balance, cycle_secs: 7 };
            let max_end = calc_max_end(balance, &s, 1_000, 7, 0, 0);
            prop_assert!(max_end >= 1_000);
            prop_assert!(solver.is_enough(max_end));
            if !solver.is_enough(u32::MAX) {
                prop_assert!(!solver.is_enough(max_end + 1));
            }
        }
    }
}
