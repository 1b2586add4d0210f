// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bounded, partitioned queues.

use std::{
    error::Error,
    fmt,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::{Backoff, sync::Unparker};

use crate::{
    consumer::{Consumer, run_batch},
    partition::{Partitioner, RollingPartitioner},
};

/// What [`Carrier::produce`] does when the target channel is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait up to `timeout` for room, then hand the item back with [`ProduceError::Timeout`].
    Block {
        /// How long a producer may wait
        timeout: Duration,
    },
    /// Evict the oldest queued item to make room. Every eviction is counted in
    /// [`CarrierStats::dropped`] and the `strata_carrier_dropped` counter.
    DropOldest,
    /// Process the item synchronously on the producing thread with the attached consumer.
    RunOnCaller,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::Block {
            timeout: Duration::from_secs(1),
        }
    }
}

/// An item that [`Carrier::produce`] could not accept, handed back to the caller.
pub enum ProduceError<T> {
    /// The channel stayed full for the whole blocking timeout
    Timeout(T),
    /// The carrier's consumer pool has shut down
    Closed(T),
    /// The channel is full under [`OverflowPolicy::RunOnCaller`] and no consumer is attached yet
    NoConsumer(T),
}

impl<T> ProduceError<T> {
    /// Recover the rejected item.
    pub fn into_inner(self) -> T {
        match self {
            ProduceError::Timeout(item)
            | ProduceError::Closed(item)
            | ProduceError::NoConsumer(item) => item,
        }
    }
}

impl<T> fmt::Debug for ProduceError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match self {
            ProduceError::Timeout(_) => "Timeout",
            ProduceError::Closed(_) => "Closed",
            ProduceError::NoConsumer(_) => "NoConsumer",
        };
        f.debug_tuple(variant).finish_non_exhaustive()
    }
}

impl<T> fmt::Display for ProduceError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProduceError::Timeout(_) => f.write_str("carrier channel stayed full until timeout"),
            ProduceError::Closed(_) => f.write_str("carrier is closed"),
            ProduceError::NoConsumer(_) => {
                f.write_str("carrier channel is full and no consumer is attached")
            }
        }
    }
}

impl<T> Error for ProduceError<T> {}

/// Point-in-time counters of a [`Carrier`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CarrierStats {
    /// Items accepted by [`Carrier::produce`]
    pub produced: u64,
    /// Items evicted under [`OverflowPolicy::DropOldest`]
    pub dropped: u64,
    /// Items handed back with [`ProduceError::Timeout`]
    pub rejected: u64,
    /// Items that went through the consumer, successfully or not
    pub consumed: u64,
    /// Items accepted but not yet through the consumer
    pub pending: usize,
}

/// Builder for [`Carrier`].
pub struct CarrierBuilder<T> {
    name: String,
    channels: usize,
    channel_size: usize,
    overflow: OverflowPolicy,
    partitioner: Box<dyn Partitioner<T>>,
}

impl<T> Default for CarrierBuilder<T> {
    fn default() -> Self {
        Self {
            name: "strata-carrier".into(),
            channels: 1,
            channel_size: 2000,
            overflow: OverflowPolicy::default(),
            partitioner: Box::new(RollingPartitioner::default()),
        }
    }
}

impl<T: Send + 'static> CarrierBuilder<T> {
    /// A builder with the defaults: one channel of 2000 items, blocking for up to a second.
    pub fn new() -> Self {
        Self::default()
    }

    /// Name used in logs and as the `carrier` label of emitted counters.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        assert!(!name.is_empty());
        self.name = name;
        self
    }

    /// Number of independent channels. Each channel is drained by exactly one pool thread.
    pub fn channels(mut self, channels: usize) -> Self {
        assert!(channels > 0, "a carrier needs at least one channel");
        self.channels = channels;
        self
    }

    /// Capacity of each channel, in items.
    ///
    /// Together with the number of channels this bounds the memory held by items waiting for a
    /// consumer.
    pub fn channel_size(mut self, channel_size: usize) -> Self {
        assert!(channel_size > 0, "channel_size must not be zero");
        self.channel_size = channel_size;
        self
    }

    /// Behavior when a channel is full. Defaults to blocking for up to one second.
    pub fn overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// How items are spread over channels. Defaults to [`RollingPartitioner`].
    pub fn partitioner(mut self, partitioner: impl Partitioner<T>) -> Self {
        self.partitioner = Box::new(partitioner);
        self
    }

    /// Build the carrier. Items queue up until a [`ConsumerPool`](crate::ConsumerPool) that it is
    /// attached to starts.
    pub fn build(self) -> Carrier<T> {
        Carrier(Arc::new(Shared {
            channels: (0..self.channels)
                .map(|_| ArrayQueue::new(self.channel_size))
                .collect(),
            name: self.name,
            partitioner: self.partitioner,
            overflow: self.overflow,
            link: OnceLock::new(),
            closed: AtomicBool::new(false),
            producing: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            produced: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
        }))
    }
}

// Counts a producer in `Shared::producing` for as long as it lives.
struct Producing<'a>(&'a AtomicUsize);

impl<'a> Producing<'a> {
    fn enter(producing: &'a AtomicUsize) -> Self {
        producing.fetch_add(1, Ordering::SeqCst);
        Self(producing)
    }
}

impl Drop for Producing<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A bounded multi-producer queue split into channels, drained by a
/// [`ConsumerPool`](crate::ConsumerPool).
///
/// Cloning is cheap and still produces into the same channels.
pub struct Carrier<T>(Arc<Shared<T>>);

impl<T> Clone for Carrier<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

pub(crate) struct Link<T> {
    pub(crate) consumer: Arc<dyn Consumer<T>>,
    // unparker of the pool thread that owns each channel, by channel index
    pub(crate) owners: Vec<Unparker>,
}

struct Shared<T> {
    name: String,
    channels: Box<[ArrayQueue<T>]>,
    partitioner: Box<dyn Partitioner<T>>,
    overflow: OverflowPolicy,
    link: OnceLock<Link<T>>,
    closed: AtomicBool,
    // producers between their closed check and the end of their push
    producing: AtomicUsize,
    // produced and not yet through the consumer
    in_flight: AtomicUsize,
    produced: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    consumed: AtomicU64,
}

impl<T: Send + 'static> Carrier<T> {
    /// A carrier with the [`CarrierBuilder`] defaults.
    pub fn new(name: impl Into<String>) -> Self {
        CarrierBuilder::new().name(name).build()
    }

    /// Enqueue `item`, applying the [`OverflowPolicy`] if its channel is full.
    ///
    /// Never blocks under [`OverflowPolicy::DropOldest`]. Under [`OverflowPolicy::Block`] it
    /// blocks for at most the configured timeout.
    pub fn produce(&self, item: T) -> Result<(), ProduceError<T>> {
        let shared = &*self.0;
        let _producing = Producing::enter(&shared.producing);
        if shared.closed.load(Ordering::SeqCst) {
            return Err(ProduceError::Closed(item));
        }
        let index = shared.partitioner.partition(&item, shared.channels.len()) % shared.channels.len();
        let channel = &shared.channels[index];

        // counted before the push so a fast consumer can never take it below zero
        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        let item = match channel.push(item) {
            Ok(()) => {
                self.accepted(index);
                return Ok(());
            }
            Err(item) => item,
        };

        match shared.overflow {
            OverflowPolicy::DropOldest => {
                if channel.force_push(item).is_some() {
                    shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                    shared.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics_024::counter!("strata_carrier_dropped", "carrier" => shared.name.clone())
                        .increment(1);
                    crate::rate_limited!(
                        Duration::from_secs(1),
                        tracing::error!(
                            carrier = %shared.name,
                            "carrier channel is full, dropping the oldest items"
                        )
                    );
                }
                self.accepted(index);
                Ok(())
            }
            OverflowPolicy::Block { timeout } => self.produce_blocking(index, item, timeout),
            OverflowPolicy::RunOnCaller => {
                shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                let Some(link) = shared.link.get() else {
                    return Err(ProduceError::NoConsumer(item));
                };
                shared.produced.fetch_add(1, Ordering::Relaxed);
                let consumed = run_batch(&*link.consumer, &mut vec![item], &shared.name);
                shared.consumed.fetch_add(consumed as u64, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    fn produce_blocking(&self, index: usize, mut item: T, timeout: Duration) -> Result<(), ProduceError<T>> {
        let shared = &*self.0;
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            self.wake(index);
            match shared.channels[index].push(item) {
                Ok(()) => {
                    self.accepted(index);
                    return Ok(());
                }
                Err(rejected) => item = rejected,
            }
            let closed = shared.closed.load(Ordering::Acquire);
            if closed || Instant::now() >= deadline {
                shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                if closed {
                    return Err(ProduceError::Closed(item));
                }
                shared.rejected.fetch_add(1, Ordering::Relaxed);
                metrics_024::counter!("strata_carrier_rejected", "carrier" => shared.name.clone())
                    .increment(1);
                crate::rate_limited!(
                    Duration::from_secs(1),
                    tracing::warn!(carrier = %shared.name, ?timeout, "carrier channel stayed full, rejecting item")
                );
                return Err(ProduceError::Timeout(item));
            }
            if backoff.is_completed() {
                thread::sleep(Duration::from_micros(200));
            } else {
                backoff.snooze();
            }
        }
    }

    fn accepted(&self, index: usize) {
        self.0.produced.fetch_add(1, Ordering::Relaxed);
        self.wake(index);
    }

    // A missed wakeup costs at most one consume cycle, the owner thread parks with a timeout.
    fn wake(&self, index: usize) {
        if let Some(link) = self.0.link.get() {
            link.owners[index].unpark();
        }
    }

    /// Carrier name.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Number of channels.
    pub fn channels(&self) -> usize {
        self.0.channels.len()
    }

    /// Items currently queued across all channels.
    pub fn len(&self) -> usize {
        self.0.channels.iter().map(ArrayQueue::len).sum()
    }

    /// Whether all channels are empty.
    pub fn is_empty(&self) -> bool {
        self.0.channels.iter().all(ArrayQueue::is_empty)
    }

    /// Snapshot of the carrier counters.
    pub fn stats(&self) -> CarrierStats {
        let shared = &*self.0;
        CarrierStats {
            produced: shared.produced.load(Ordering::Relaxed),
            dropped: shared.dropped.load(Ordering::Relaxed),
            rejected: shared.rejected.load(Ordering::Relaxed),
            consumed: shared.consumed.load(Ordering::Relaxed),
            pending: shared.in_flight.load(Ordering::Acquire),
        }
    }

    /// Block until every accepted item has been through the consumer, or `timeout` passes.
    ///
    /// Returns whether the carrier went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.0.in_flight.load(Ordering::Acquire) != 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    pub(crate) fn bind(&self, consumer: Arc<dyn Consumer<T>>, owners: Vec<Unparker>) {
        debug_assert_eq!(owners.len(), self.channels());
        let bound = self.0.link.set(Link { consumer, owners }).is_ok();
        assert!(bound, "carrier `{}` is already attached to a consumer pool", self.0.name);
    }

    /// Reject new items, then wait for producers already past the check to finish their push, so
    /// everything accepted is in a channel before the final drain.
    pub(crate) fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
        let backoff = Backoff::new();
        while self.0.producing.load(Ordering::SeqCst) != 0 {
            if backoff.is_completed() {
                thread::sleep(Duration::from_micros(200));
            } else {
                backoff.snooze();
            }
        }
    }

    /// Move up to `max` items from channel `index` into `batch`.
    pub(crate) fn pop_batch(&self, index: usize, batch: &mut Vec<T>, max: usize) {
        let channel = &self.0.channels[index];
        while batch.len() < max {
            match channel.pop() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
    }

    pub(crate) fn finish_batch(&self, count: usize) {
        self.0.in_flight.fetch_sub(count, Ordering::AcqRel);
        self.0.consumed.fetch_add(count as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use assert2::check;

    use super::*;

    #[test]
    fn drop_oldest_counts_evictions() {
        let carrier = CarrierBuilder::new()
            .channel_size(4)
            .overflow(OverflowPolicy::DropOldest)
            .build();
        for i in 0..10 {
            check!(carrier.produce(i).is_ok());
        }
        let stats = carrier.stats();
        check!(stats.produced == 10);
        check!(stats.dropped == 6);
        check!(stats.pending == 4);

        let mut batch = Vec::new();
        carrier.pop_batch(0, &mut batch, 100);
        check!(batch == [6, 7, 8, 9]);
    }

    #[test]
    fn block_times_out_and_returns_item() {
        let carrier = CarrierBuilder::new()
            .channel_size(1)
            .overflow(OverflowPolicy::Block {
                timeout: Duration::from_millis(20),
            })
            .build();
        check!(carrier.produce(1).is_ok());
        let started = Instant::now();
        let rejected = carrier.produce(2).unwrap_err();
        check!(started.elapsed() >= Duration::from_millis(20));
        check!(matches!(rejected, ProduceError::Timeout(2)));
        check!(carrier.stats().rejected == 1);
        check!(carrier.stats().pending == 1);
    }

    #[test]
    fn run_on_caller_needs_a_consumer() {
        let carrier = CarrierBuilder::new()
            .channel_size(1)
            .overflow(OverflowPolicy::RunOnCaller)
            .build();
        check!(carrier.produce(1).is_ok());
        check!(matches!(carrier.produce(2), Err(ProduceError::NoConsumer(2))));
    }

    #[test]
    fn closed_carrier_rejects() {
        let carrier: Carrier<u32> = Carrier::new("closing");
        carrier.close();
        check!(carrier.produce(7).unwrap_err().into_inner() == 7);
        check!(carrier.wait_idle(Duration::ZERO));
    }
}
