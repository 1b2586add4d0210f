// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Rate limiting for background error logs.

use std::{
    sync::{
        OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

fn millis_since_start() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let elapsed = START.get_or_init(Instant::now).elapsed();
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Claim the next slot of a rate limited call site. Used by [`rate_limited!`](crate::rate_limited).
#[doc(hidden)]
pub fn acquire(next_allowed: &AtomicU64, interval: Duration) -> bool {
    let now = millis_since_start();
    let scheduled = next_allowed.load(Ordering::Relaxed);
    if now < scheduled {
        return false;
    }
    let interval = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    next_allowed
        .compare_exchange(
            scheduled,
            now.saturating_add(interval).max(1),
            Ordering::Relaxed,
            Ordering::Relaxed,
        )
        .is_ok()
}

/// `rate_limited!(interval, expr)` evaluates `expr` at most once per `interval` across all threads.
///
/// The limit is per call site. Hot-path failure logs (queue overflow, failing consumers, failing
/// storage flushes) go through this so a persistent fault logs once and then periodically rather
/// than once per item.
///
/// ```
/// use std::time::Duration;
///
/// let mut logged = 0;
/// for _ in 0..100 {
///     strata_carrier::rate_limited!(Duration::from_secs(60), logged += 1);
/// }
/// assert_eq!(logged, 1);
/// ```
#[macro_export]
macro_rules! rate_limited {
    ($interval:expr, $call:expr) => {{
        static NEXT_ALLOWED: ::std::sync::atomic::AtomicU64 = ::std::sync::atomic::AtomicU64::new(0);
        if $crate::rate_limit::acquire(&NEXT_ALLOWED, $interval) {
            $call;
        }
    }};
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn first_call_always_runs() {
        let counter = Cell::new(0u64);
        let incr = || crate::rate_limited!(Duration::MAX, counter.set(counter.get() + 1));
        incr();
        assert_eq!(counter.get(), 1);
        for _ in 0..1000 {
            incr();
        }
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn call_sites_are_independent() {
        let counter = Cell::new(0u64);
        crate::rate_limited!(Duration::MAX, counter.set(counter.get() + 1));
        crate::rate_limited!(Duration::MAX, counter.set(counter.get() + 1));
        assert_eq!(counter.get(), 2);
    }
}
