// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Double-buffered aggregation window.
//!
//! A [`Window`] holds two [`MergeableBuffer`] slots. Producers always write into the active slot.
//! [`Window::begin_drain`] flips the active slot, waits for writers still inside the old one to
//! leave, and hands the old slot to the caller through a [`DrainGuard`]. Dropping the guard clears
//! the drained slot so the next flip can reuse it.
//!
//! Writers never take a lock. A writer registers itself on the slot it read as active, then checks
//! the slot is still active before writing. The drain side flips the active index, then waits for
//! the old slot's writer count to reach zero. Both sides use sequentially consistent operations, so
//! either the writer sees the flip and retries on the new slot, or the drain sees the writer and
//! waits for it. Every write lands in exactly one generation and none lands in a generation that is
//! being read.

use std::sync::{
    Mutex, MutexGuard, TryLockError,
    atomic::{AtomicUsize, Ordering},
};

use crossbeam_utils::Backoff;
use strata_core::Metrics;

use crate::buffer::MergeableBuffer;

#[derive(Debug)]
struct Slot<M> {
    buffer: MergeableBuffer<M>,
    writers: AtomicUsize,
}

impl<M> Default for Slot<M> {
    fn default() -> Self {
        Self {
            buffer: MergeableBuffer::default(),
            writers: AtomicUsize::new(0),
        }
    }
}

// Leaves the slot on drop, also when a merge panics, so a drain never waits on a dead writer.
struct WriterGuard<'a>(&'a AtomicUsize);

impl<'a> WriterGuard<'a> {
    fn enter(writers: &'a AtomicUsize) -> Self {
        writers.fetch_add(1, Ordering::SeqCst);
        Self(writers)
    }
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Two generations of a merge map: one being filled, one being drained.
#[derive(Debug)]
pub struct Window<M> {
    slots: [Slot<M>; 2],
    active: AtomicUsize,
    draining: Mutex<()>,
}

impl<M> Default for Window<M> {
    fn default() -> Self {
        Self {
            slots: [Slot::default(), Slot::default()],
            active: AtomicUsize::new(0),
            draining: Mutex::new(()),
        }
    }
}

impl<M: Metrics> Window<M> {
    /// An empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `metrics` into the active generation. Never blocks on a drain.
    pub fn write(&self, metrics: M) {
        loop {
            let index = self.active.load(Ordering::SeqCst);
            let slot = &self.slots[index];
            let _writer = WriterGuard::enter(&slot.writers);
            if self.active.load(Ordering::SeqCst) != index {
                // flipped under us, this slot belongs to the drain now
                continue;
            }
            slot.buffer.accept(metrics);
            return;
        }
    }

    /// Flip generations and take the one that was active.
    ///
    /// # Panics
    ///
    /// Panics if another drain of this window is still in progress. Drains are driven by a single
    /// round driver; overlapping drains would read a generation that is being written.
    pub fn begin_drain(&self) -> DrainGuard<'_, M> {
        let lock = match self.draining.try_lock() {
            Ok(lock) => lock,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                panic!("concurrent drain of the same aggregation window")
            }
        };
        let index = self.active.load(Ordering::SeqCst);
        // the other slot was cleared when its own drain ended
        self.active.store(1 - index, Ordering::SeqCst);
        let slot = &self.slots[index];
        let backoff = Backoff::new();
        while slot.writers.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }
        DrainGuard {
            slot,
            _lock: lock,
        }
    }

    /// Records in the active generation. For diagnostics, not synchronized with drains.
    pub fn pending(&self) -> usize {
        self.slots[self.active.load(Ordering::SeqCst)].buffer.len()
    }
}

/// Exclusive access to a drained generation. Dropping it ends the drain.
#[derive(Debug)]
pub struct DrainGuard<'a, M> {
    slot: &'a Slot<M>,
    _lock: MutexGuard<'a, ()>,
}

impl<M: Metrics> DrainGuard<'_, M> {
    /// Move every record out of the drained generation.
    pub fn take(&mut self) -> Vec<M> {
        self.slot.buffer.drain()
    }

    /// Visit the drained records without taking them.
    pub fn for_each(&self, visit: impl FnMut(&M)) {
        self.slot.buffer.for_each(visit)
    }

    /// Number of drained records.
    pub fn len(&self) -> usize {
        self.slot.buffer.len()
    }

    /// Whether nothing was drained.
    pub fn is_empty(&self) -> bool {
        self.slot.buffer.is_empty()
    }

    /// End the drain. Same as dropping the guard.
    pub fn end(self) {}
}

impl<M> Drop for DrainGuard<'_, M> {
    fn drop(&mut self) {
        self.slot.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{self, AssertUnwindSafe},
        sync::{
            Arc, mpsc,
            atomic::{AtomicBool, AtomicI64},
        },
        thread,
        time::Duration,
    };

    use assert2::check;
    use strata_core::{
        Downsampling, EntityId, FieldError, FromStorageFields, MetricId, StorageFields, TimeBucket,
        ToStorageFields, functions::SumMetrics,
    };

    use super::*;

    fn id(entity: &str) -> MetricId {
        MetricId::new(
            EntityId::single(entity),
            TimeBucket::new(20240101, Downsampling::Day).unwrap(),
        )
    }

    #[test]
    fn drain_swaps_generations() {
        let window = Window::new();
        window.write(SumMetrics::new(id("a"), 1));
        window.write(SumMetrics::new(id("a"), 2));
        window.write(SumMetrics::new(id("b"), 5));

        let mut guard = window.begin_drain();
        window.write(SumMetrics::new(id("a"), 100));
        let mut drained = guard.take();
        drained.sort_by(|l, r| l.id().cmp(r.id()));
        check!(drained.iter().map(SumMetrics::value).collect::<Vec<_>>() == [3, 5]);
        guard.end();

        let drained = window.begin_drain().take();
        check!(drained.len() == 1);
        check!(drained[0].value() == 100);
        check!(window.begin_drain().is_empty());
    }

    #[test]
    #[should_panic(expected = "concurrent drain")]
    fn overlapping_drains_are_fatal() {
        let window: Window<SumMetrics> = Window::new();
        let _first = window.begin_drain();
        let _second = window.begin_drain();
    }

    #[test]
    fn concurrent_writes_land_in_exactly_one_generation() {
        let window = Arc::new(Window::new());
        let stop = Arc::new(AtomicBool::new(false));
        let written = Arc::new(AtomicI64::new(0));
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let (window, stop, written) = (window.clone(), stop.clone(), written.clone());
                thread::spawn(move || {
                    let entity = format!("writer-{}", w % 2);
                    while !stop.load(Ordering::Relaxed) {
                        window.write(SumMetrics::new(id(&entity), 1));
                        written.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        let mut drained_total = 0;
        for _ in 0..200 {
            let mut guard = window.begin_drain();
            drained_total += guard.take().iter().map(SumMetrics::value).sum::<i64>();
            guard.end();
        }
        stop.store(true, Ordering::Relaxed);
        for writer in writers {
            writer.join().unwrap();
        }
        for _ in 0..2 {
            drained_total += window.begin_drain().take().iter().map(SumMetrics::value).sum::<i64>();
        }
        check!(drained_total == written.load(Ordering::Relaxed));
    }

    // a record whose merge always panics
    #[derive(Clone, Debug)]
    struct Exploding(MetricId);

    impl ToStorageFields for Exploding {
        fn to_storage_fields(&self) -> StorageFields {
            StorageFields::new()
        }
    }

    impl FromStorageFields for Exploding {
        fn from_storage_fields(id: MetricId, _fields: &StorageFields) -> Result<Self, FieldError> {
            Ok(Self(id))
        }
    }

    impl Metrics for Exploding {
        fn id(&self) -> &MetricId {
            &self.0
        }

        fn combine(&mut self, _other: &Self) -> bool {
            panic!("merge failed")
        }

        fn calculate(&mut self) {}
    }

    #[test]
    fn panicking_merge_does_not_block_the_next_drain() {
        let window = Arc::new(Window::new());
        window.write(Exploding(id("a")));
        let write = panic::catch_unwind(AssertUnwindSafe(|| window.write(Exploding(id("a")))));
        check!(write.is_err());

        let (drained, done) = mpsc::channel();
        let drainer = {
            let window = window.clone();
            thread::spawn(move || {
                let count = window.begin_drain().len();
                let _ = drained.send(count);
            })
        };
        check!(done.recv_timeout(Duration::from_secs(5)) == Ok(1));
        drainer.join().unwrap();
    }
}
