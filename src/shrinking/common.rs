//! Boundary search shared by the shrink passes.

use std::convert::Infallible;

/// Finds a (hopefully large) integer `n` such that `f(n)` is true and
/// `f(n + 1)` is false.
///
/// `f(0)` is assumed to be true and is never evaluated. Small answers are
/// found by a linear probe; larger ones by exponential probing followed by a
/// binary search, so the number of calls is logarithmic in the result.
///
/// If `f` is not monotonic the result is still some `n` with `f(n)` true (or
/// zero), it just may not be the largest one.
pub fn find_integer<F>(mut f: F) -> u64
where
    F: FnMut(u64) -> bool,
{
    match try_find_integer(|n| Ok::<bool, Infallible>(f(n))) {
        Ok(n) => n,
        Err(never) => match never {},
    }
}

/// Fallible form of [`find_integer`]: the first error returned by `f` aborts
/// the search and is propagated.
pub fn try_find_integer<F, E>(mut f: F) -> Result<u64, E>
where
    F: FnMut(u64) -> Result<bool, E>,
{
    // Linear scan first: when the answer is small, probing 2 before 1 wastes calls.
    for i in 1..5 {
        if !f(i)? {
            return Ok(i - 1);
        }
    }

    // f(lo) is known true, hi is the smallest value known (or being tested) false.
    let mut lo: u64 = 4;
    let mut hi: u64 = 5;
    while f(hi)? {
        lo = hi;
        hi = match hi.checked_mul(2) {
            Some(next) => next,
            None => return Ok(lo),
        };
    }

    while lo + 1 < hi {
        let mid = lo + (hi - lo) / 2;
        if f(mid)? {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calls_for(n: u64) -> (u64, usize) {
        let mut calls = 0;
        let found = find_integer(|i| {
            calls += 1;
            i <= n
        });
        (found, calls)
    }

    #[test]
    fn test_finds_exact_boundary() {
        for n in [0u64, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 17, 100, 1000, 65_535, 1 << 40] {
            let (found, _) = calls_for(n);
            assert_eq!(found, n, "boundary {} not found", n);
        }
    }

    #[test]
    fn test_never_evaluates_zero() {
        let mut saw_zero = false;
        find_integer(|i| {
            if i == 0 {
                saw_zero = true;
            }
            i < 3
        });
        assert!(!saw_zero);
    }

    #[test]
    fn test_small_results_use_linear_probe() {
        assert_eq!(calls_for(0), (0, 1));
        assert_eq!(calls_for(2), (2, 3));
        assert_eq!(calls_for(3), (3, 4));
    }

    #[test]
    fn test_call_count_is_logarithmic() {
        let (found, calls) = calls_for(1_000_000);
        assert_eq!(found, 1_000_000);
        // ~18 doublings plus ~18 bisections on top of the 4 linear probes
        assert!(calls < 50, "took {} calls", calls);
    }

    #[test]
    fn test_always_true_stops_at_overflow() {
        let found = find_integer(|_| true);
        assert!(found > 1 << 62);
    }

    #[test]
    fn test_errors_abort_the_search() {
        let mut calls = 0;
        let result: Result<u64, &str> = try_find_integer(|i| {
            calls += 1;
            if i == 5 {
                Err("boom")
            } else {
                Ok(true)
            }
        });
        assert_eq!(result, Err("boom"));
        assert_eq!(calls, 5);
    }
}
