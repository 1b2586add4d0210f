// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Accumulators and the merge operations that combine them.
//!
//! Each field of a metric record is an [`Accumulator`] tagged with a [`MergeOp`]. Combining two
//! partial records applies every field's operation, field by field:
//!
//! ```
//! use strata_core::accumulate::{Accumulator, Add, Max};
//!
//! let mut total: Accumulator<i64, Add> = Accumulator::new(3);
//! total.merge(&Accumulator::new(4));
//! assert_eq!(*total.value(), 7);
//!
//! let mut peak: Accumulator<i64, Max> = Accumulator::new(3);
//! peak.merge(&Accumulator::new(2));
//! assert_eq!(*peak.value(), 3);
//! ```
//!
//! [`Add`], [`Min`] and [`Max`] are associative and commutative, so rounds may merge partials in any
//! order. [`LatestWins`] is not, and relies on rounds being driven in wall-clock order.

use std::{collections::BTreeMap, marker::PhantomData};

use derive_where::derive_where;

/// How an incoming partial value is folded into an existing one.
pub trait MergeOp<T> {
    /// Fold `incoming` into `existing`.
    fn merge(existing: &mut T, incoming: &T);
}

/// Numbers [`Add`] can sum. Integers wrap on overflow instead of panicking.
pub trait Summable: Copy {
    /// `self + other`
    fn sum(self, other: Self) -> Self;
}

macro_rules! wrapping_summable {
    ($($ty:ty),*) => {
        $(impl Summable for $ty {
            fn sum(self, other: Self) -> Self {
                self.wrapping_add(other)
            }
        })*
    };
}

wrapping_summable!(i32, i64, u32, u64, usize);

impl Summable for f64 {
    fn sum(self, other: Self) -> Self {
        self + other
    }
}

/// Sums values. Use for counts, totals and sums.
pub struct Add;

impl<T: Summable> MergeOp<T> for Add {
    fn merge(existing: &mut T, incoming: &T) {
        *existing = existing.sum(*incoming);
    }
}

/// Keeps the smaller value.
pub struct Min;

impl<T: Copy + PartialOrd> MergeOp<T> for Min {
    fn merge(existing: &mut T, incoming: &T) {
        if *incoming < *existing {
            *existing = *incoming;
        }
    }
}

/// Keeps the larger value.
pub struct Max;

impl<T: Copy + PartialOrd> MergeOp<T> for Max {
    fn merge(existing: &mut T, incoming: &T) {
        if *incoming > *existing {
            *existing = *incoming;
        }
    }
}

/// Overwrites with the incoming value.
pub struct LatestWins;

impl<T: Clone> MergeOp<T> for LatestWins {
    fn merge(existing: &mut T, incoming: &T) {
        existing.clone_from(incoming);
    }
}

/// Keeps the existing value. Used for fields that are fixed at creation, like a precision setting.
pub struct NonOp;

impl<T> MergeOp<T> for NonOp {
    fn merge(_existing: &mut T, _incoming: &T) {}
}

impl MergeOp<BucketCounts> for Add {
    fn merge(existing: &mut BucketCounts, incoming: &BucketCounts) {
        for (bucket, count) in &incoming.counts {
            let held = existing.counts.entry(*bucket).or_default();
            *held = held.wrapping_add(*count);
        }
    }
}

/// A value tagged with the [`MergeOp`] used to combine it.
#[derive_where(Clone, Copy, Debug, PartialEq, Eq, Default; T)]
pub struct Accumulator<T, Op> {
    value: T,
    _op: PhantomData<fn() -> Op>,
}

impl<T, Op> Accumulator<T, Op> {
    /// Wrap an initial value.
    pub fn new(value: T) -> Self {
        Self {
            value,
            _op: PhantomData,
        }
    }

    /// The current value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Replace the current value. Used for derived fields recomputed by `calculate`.
    pub fn set(&mut self, value: T) {
        self.value = value;
    }

    /// Combine another partial of the same field into this one.
    pub fn merge(&mut self, other: &Self)
    where
        Op: MergeOp<T>,
    {
        Op::merge(&mut self.value, &other.value);
    }

    /// Fold a single raw observation into this accumulator.
    pub fn record(&mut self, value: T)
    where
        Op: MergeOp<T>,
    {
        Op::merge(&mut self.value, &value);
    }
}

/// Sparse counts of values grouped into fixed-width buckets.
///
/// Bucket keys are `value / precision`, so the count for key `k` covers values in
/// `[k * precision, (k + 1) * precision)`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BucketCounts {
    counts: BTreeMap<u64, u64>,
}

impl BucketCounts {
    /// Count one observation of `value`.
    pub fn record(&mut self, value: u64, precision: u64) {
        *self.counts.entry(value / precision.max(1)).or_default() += 1;
    }

    /// Count `count` observations falling into bucket key `bucket`.
    pub fn add_bucket(&mut self, bucket: u64, count: u64) {
        let held = self.counts.entry(bucket).or_default();
        *held = held.wrapping_add(count);
    }

    /// Total number of observations.
    pub fn total(&self) -> u64 {
        self.counts.values().fold(0, |total, count| total.wrapping_add(*count))
    }

    /// `(bucket key, count)` pairs in ascending bucket order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.counts.iter().map(|(bucket, count)| (*bucket, *count))
    }

    /// Lower bound of the bucket holding the `rank`-th percentile, `rank` in `0..=100`.
    ///
    /// Returns 0 for an empty set of counts.
    pub fn percentile(&self, rank: u8, precision: u64) -> u64 {
        let total = self.total();
        if total == 0 {
            return 0;
        }
        // nearest-rank: the smallest bucket covering at least rank% of observations
        let target = total.saturating_mul(u64::from(rank.min(100))).div_ceil(100).max(1);
        let mut seen = 0;
        for (bucket, count) in &self.counts {
            seen = count.saturating_add(seen);
            if seen >= target {
                return bucket * precision.max(1);
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use assert2::check;
    use rand::{SeedableRng, seq::SliceRandom};
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn fold<Op: MergeOp<i64>>(values: &[i64]) -> i64 {
        let mut acc: Accumulator<i64, Op> = Accumulator::new(values[0]);
        for value in &values[1..] {
            acc.merge(&Accumulator::new(*value));
        }
        *acc.value()
    }

    #[test]
    fn associative_ops_ignore_merge_order() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut values: Vec<i64> = (-50..150).collect();
        let (sum, min, max) = (fold::<Add>(&values), fold::<Min>(&values), fold::<Max>(&values));
        for _ in 0..20 {
            values.shuffle(&mut rng);
            check!(fold::<Add>(&values) == sum);
            check!(fold::<Min>(&values) == min);
            check!(fold::<Max>(&values) == max);
        }
        check!(sum == (-50..150).sum::<i64>());
        check!(min == -50);
        check!(max == 149);
    }

    #[test]
    fn sums_wrap_instead_of_panicking() {
        check!(fold::<Add>(&[i64::MAX, 1]) == i64::MIN);

        let mut counts = BucketCounts::default();
        counts.add_bucket(0, u64::MAX);
        let mut total: Accumulator<BucketCounts, Add> = Accumulator::new(counts.clone());
        total.merge(&Accumulator::new(counts));
        check!(total.value().counts[&0] == u64::MAX - 1);
    }

    #[test]
    fn latest_wins_and_non_op() {
        check!(fold::<LatestWins>(&[1, 5, 3]) == 3);
        check!(fold::<NonOp>(&[1, 5, 3]) == 1);
    }

    #[test]
    fn bucket_counts_merge_and_rank() {
        let mut a = BucketCounts::default();
        let mut b = BucketCounts::default();
        for value in 0..50 {
            a.record(value * 10, 10);
        }
        for value in 50..100 {
            b.record(value * 10, 10);
        }
        let mut merged: Accumulator<BucketCounts, Add> = Accumulator::new(a);
        merged.merge(&Accumulator::new(b));
        let counts = merged.value();
        check!(counts.total() == 100);
        check!(counts.percentile(50, 10) == 490);
        check!(counts.percentile(99, 10) == 980);
        check!(counts.percentile(100, 10) == 990);
        check!(BucketCounts::default().percentile(50, 10) == 0);
    }
}
