// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Channel selection for multi-channel carriers.

use std::{
    hash::Hash,
    marker::PhantomData,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Chooses which channel of a [`Carrier`](crate::Carrier) an item goes to.
pub trait Partitioner<T>: Send + Sync + 'static {
    /// A channel index in `0..channels`. Out of range results are wrapped.
    fn partition(&self, item: &T, channels: usize) -> usize;
}

/// Spreads items over channels in turn. The default.
#[derive(Debug, Default)]
pub struct RollingPartitioner {
    next: AtomicUsize,
}

impl<T> Partitioner<T> for RollingPartitioner {
    fn partition(&self, _item: &T, channels: usize) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % channels.max(1)
    }
}

/// Routes items by the hash of a key, so all items sharing a key land on the same channel.
///
/// Since every channel is drained by exactly one pool thread, this serializes processing of all
/// items with the same key.
pub struct KeyPartitioner<F, K> {
    key: F,
    hasher: ahash::RandomState,
    _key: PhantomData<fn() -> K>,
}

impl<F, K> KeyPartitioner<F, K> {
    /// Partition by the key that `key` extracts from each item.
    pub fn new(key: F) -> Self {
        Self {
            key,
            hasher: ahash::RandomState::new(),
            _key: PhantomData,
        }
    }
}

impl<T, K, F> Partitioner<T> for KeyPartitioner<F, K>
where
    F: Fn(&T) -> K + Send + Sync + 'static,
    K: Hash + 'static,
{
    fn partition(&self, item: &T, channels: usize) -> usize {
        (self.hasher.hash_one((self.key)(item)) % channels.max(1) as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use assert2::check;

    use super::*;

    #[test]
    fn rolling_cycles_channels() {
        let partitioner = RollingPartitioner::default();
        let picked: Vec<usize> = (0..6).map(|i| partitioner.partition(&i, 3)).collect();
        check!(picked == [0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn key_partitioner_is_stable_per_key() {
        let partitioner = KeyPartitioner::new(|item: &(u32, u32)| item.0);
        for key in 0..50 {
            let first = partitioner.partition(&(key, 0), 4);
            check!(first < 4);
            for other in 1..10 {
                check!(partitioner.partition(&(key, other), 4) == first);
            }
        }
    }
}
