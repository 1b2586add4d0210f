// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Concurrent merge-on-insert map of partial records.

use dashmap::{DashMap, mapref::entry::Entry};
use strata_core::{MetricId, Metrics};

/// A map from identity to partially aggregated record that merges on collision.
///
/// Any number of threads may [`accept`](Self::accept) concurrently. Each identity is held by
/// exactly one shard, and merges into it are serialized by that shard's lock.
#[derive(Debug)]
pub struct MergeableBuffer<M> {
    records: DashMap<MetricId, M>,
}

impl<M> Default for MergeableBuffer<M> {
    fn default() -> Self {
        Self {
            records: DashMap::new(),
        }
    }
}

impl<M> MergeableBuffer<M> {
    /// Drop every record.
    pub fn clear(&self) {
        self.records.clear();
    }
}

impl<M: Metrics> MergeableBuffer<M> {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `metrics`, or combine it into the record already held for its identity.
    ///
    /// An abandoned combine leaves the held record as it was.
    pub fn accept(&self, metrics: M) {
        match self.records.entry(metrics.id().clone()) {
            Entry::Occupied(mut held) => {
                held.get_mut().combine(&metrics);
            }
            Entry::Vacant(slot) => {
                slot.insert(metrics);
            }
        }
    }

    /// Remove and return every record.
    ///
    /// Records accepted concurrently with a drain may or may not be included, but are never lost:
    /// whatever isn't returned stays in the buffer.
    pub fn drain(&self) -> Vec<M> {
        let ids: Vec<MetricId> = self.records.iter().map(|held| held.key().clone()).collect();
        ids.iter()
            .filter_map(|id| self.records.remove(id).map(|(_, metrics)| metrics))
            .collect()
    }

    /// Clone of the record held for `id`.
    pub fn get(&self, id: &MetricId) -> Option<M> {
        self.records.get(id).map(|held| held.value().clone())
    }

    /// Visit every held record.
    pub fn for_each(&self, mut visit: impl FnMut(&M)) {
        for held in self.records.iter() {
            visit(held.value());
        }
    }

    /// Number of distinct identities held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the buffer holds nothing.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

}

#[cfg(test)]
mod tests {
    use std::thread;

    use assert2::check;
    use strata_core::{
        Downsampling, EntityId, TimeBucket,
        functions::{LatestMetrics, SumMetrics},
    };

    use super::*;

    fn id(entity: &str) -> MetricId {
        MetricId::new(
            EntityId::single(entity),
            TimeBucket::new(20240101, Downsampling::Day).unwrap(),
        )
    }

    #[test]
    fn colliding_identities_are_merged() {
        let buffer = MergeableBuffer::new();
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..250 {
                        buffer.accept(SumMetrics::new(id("a"), 1));
                        buffer.accept(SumMetrics::new(id("b"), 2));
                    }
                });
            }
        });
        check!(buffer.len() == 2);
        check!(buffer.get(&id("a")).map(|m| m.value()) == Some(1000));
        check!(buffer.get(&id("b")).map(|m| m.value()) == Some(2000));

        let mut drained: Vec<_> = buffer.drain().iter().map(SumMetrics::value).collect();
        drained.sort();
        check!(drained == [1000, 2000]);
        check!(buffer.is_empty());
    }

    #[test]
    fn abandoned_combine_keeps_the_held_record() {
        let buffer = MergeableBuffer::new();
        buffer.accept(LatestMetrics::new(id("a"), 7, 2_000));
        buffer.accept(LatestMetrics::new(id("a"), 3, 1_000));
        check!(buffer.get(&id("a")).map(|m| m.value()) == Some(7));
    }
}
