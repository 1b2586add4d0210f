// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Session cache of recently persisted records.
//!
//! The cache maps identity to the last merged record and the round timestamp it was last touched
//! at. It decides whether a drained record becomes an insert or an update, and saves a storage
//! read for identities that keep receiving traffic.
//!
//! Every mutation of one identity goes through that identity's shard lock and carries a round
//! timestamp. Write confirmations ([`SessionCacheCallback`]) compare timestamps under that lock:
//! an insert confirmation never replaces a newer entry, and an update failure only evicts the
//! entry it was issued for. Callbacks for the same identity from concurrent batch flushes therefore
//! resolve the same way regardless of the order they fire in.

use std::{sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use strata_core::{MetricId, Metrics};

use crate::request::{RequestKind, WriteCallback};

#[derive(Debug, Clone)]
struct CacheEntry<M> {
    metrics: M,
    last_update: i64,
}

/// Identity to last known persisted record, with a soft expiry.
#[derive(Debug)]
pub struct SessionCache<M> {
    entries: DashMap<MetricId, CacheEntry<M>>,
}

impl<M> Default for SessionCache<M> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<M: Metrics> SessionCache<M> {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of the cached record for `id`.
    pub fn get(&self, id: &MetricId) -> Option<M> {
        self.entries.get(id).map(|entry| entry.metrics.clone())
    }

    /// Whether `id` is cached.
    pub fn contains(&self, id: &MetricId) -> bool {
        self.entries.contains_key(id)
    }

    /// Epoch millis `id` was last touched at.
    pub fn last_update(&self, id: &MetricId) -> Option<i64> {
        self.entries.get(id).map(|entry| entry.last_update)
    }

    /// Cache `metrics` as of `now`, unless a newer entry is already cached.
    ///
    /// Used for records loaded from storage, merged in a round, and confirmed inserts.
    pub fn put(&self, metrics: M, now: i64) {
        match self.entries.entry(metrics.id().clone()) {
            Entry::Occupied(mut held) => {
                if held.get().last_update <= now {
                    held.insert(CacheEntry {
                        metrics,
                        last_update: now,
                    });
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(CacheEntry {
                    metrics,
                    last_update: now,
                });
            }
        }
    }

    /// Remove `id` unconditionally.
    pub fn remove(&self, id: &MetricId) -> Option<M> {
        self.entries.remove(id).map(|(_, entry)| entry.metrics)
    }

    /// Remove `id` if it was not touched after `stamp`.
    pub fn remove_if_not_newer(&self, id: &MetricId, stamp: i64) -> bool {
        self.entries
            .remove_if(id, |_, entry| entry.last_update <= stamp)
            .is_some()
    }

    /// Evict entries not touched within `timeout` of `now`. Returns how many were evicted.
    pub fn evict_expired(&self, now: i64, timeout: Duration) -> usize {
        let timeout = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_sub(entry.last_update) <= timeout);
        before.saturating_sub(self.entries.len())
    }

    /// Number of cached identities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Keeps the session cache consistent with storage once a write's outcome is known.
///
/// - A confirmed insert caches the inserted record.
/// - A failed update evicts the identity, so the next round reloads it from storage.
/// - A failed insert and a confirmed update leave the cache alone; the update was already applied
///   to the cache when the round merged it.
pub struct SessionCacheCallback<M> {
    cache: Arc<SessionCache<M>>,
    kind: RequestKind,
    metrics: M,
    stamp: i64,
}

impl<M: Metrics> SessionCacheCallback<M> {
    /// Callback for an insert of `metrics` prepared in the round stamped `stamp`.
    pub fn insert(cache: Arc<SessionCache<M>>, metrics: M, stamp: i64) -> Self {
        Self {
            cache,
            kind: RequestKind::Insert,
            metrics,
            stamp,
        }
    }

    /// Callback for an update of `metrics` prepared in the round stamped `stamp`.
    pub fn update(cache: Arc<SessionCache<M>>, metrics: M, stamp: i64) -> Self {
        Self {
            cache,
            kind: RequestKind::Update,
            metrics,
            stamp,
        }
    }
}

impl<M: Metrics> WriteCallback for SessionCacheCallback<M> {
    fn on_success(self: Box<Self>) {
        if self.kind == RequestKind::Insert {
            self.cache.put(self.metrics, self.stamp);
        }
    }

    fn on_failure(self: Box<Self>) {
        if self.kind == RequestKind::Update {
            self.cache
                .remove_if_not_newer(self.metrics.id(), self.stamp);
        }
    }
}

#[cfg(test)]
mod tests {
    use assert2::check;
    use strata_core::{Downsampling, EntityId, TimeBucket, functions::SumMetrics};

    use super::*;

    fn sum(value: i64) -> SumMetrics {
        SumMetrics::new(
            MetricId::new(
                EntityId::single("svc"),
                TimeBucket::new(20240101, Downsampling::Day).unwrap(),
            ),
            value,
        )
    }

    #[test]
    fn eviction_bounds_entry_age() {
        let cache = SessionCache::new();
        cache.put(sum(1), 1_000);
        check!(cache.evict_expired(1_100, Duration::from_millis(100)) == 0);
        check!(cache.evict_expired(1_150, Duration::from_millis(100)) == 1);
        check!(cache.is_empty());
    }

    #[test]
    fn late_insert_confirmation_does_not_overwrite_newer_state() {
        let cache = Arc::new(SessionCache::new());
        let early = Box::new(SessionCacheCallback::insert(cache.clone(), sum(1), 1_000));
        cache.put(sum(10), 2_000);
        early.on_success();
        check!(cache.get(sum(0).id()).map(|m| m.value()) == Some(10));
    }

    #[test]
    fn update_failure_only_evicts_its_own_round() {
        let cache = Arc::new(SessionCache::new());
        cache.put(sum(5), 1_000);
        let stale = Box::new(SessionCacheCallback::update(cache.clone(), sum(5), 1_000));
        cache.put(sum(9), 2_000);
        stale.on_failure();
        check!(cache.contains(sum(0).id()));

        let current = Box::new(SessionCacheCallback::update(cache.clone(), sum(9), 2_000));
        current.on_failure();
        check!(!cache.contains(sum(0).id()));
    }
}
