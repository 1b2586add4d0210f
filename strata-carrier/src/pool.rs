// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-size thread pools draining carriers.

use std::{
    collections::BTreeSet,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_utils::sync::{Parker, Unparker};

use crate::{
    carrier::Carrier,
    consumer::{Consumer, run_batch},
};

/// Builder for [`ConsumerPool`].
#[derive(Clone, Debug)]
pub struct ConsumerPoolBuilder {
    name: String,
    threads: usize,
    batch_size: usize,
    consume_cycle: Duration,
    shutdown_timeout: Duration,
}

impl Default for ConsumerPoolBuilder {
    fn default() -> Self {
        let cores = thread::available_parallelism().map_or(1, usize::from);
        Self {
            name: "strata-consumer".into(),
            threads: (cores / 8).max(1),
            batch_size: 1000,
            consume_cycle: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ConsumerPoolBuilder {
    /// A builder with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool name, used for thread names and the tracing span.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        assert!(!name.is_empty());
        self.name = name;
        self
    }

    /// Number of consumer threads. Defaults to an eighth of the available cores, at least one.
    ///
    /// `threads * batch_size` bounds how many items are being processed at any moment.
    pub fn threads(mut self, threads: usize) -> Self {
        assert!(threads > 0, "a consumer pool needs at least one thread");
        self.threads = threads;
        self
    }

    /// Maximum number of items handed to [`Consumer::consume`] at once. Defaults to 1000.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch_size must not be zero");
        self.batch_size = batch_size;
        self
    }

    /// How long an idle thread parks before polling its channels again. Defaults to 20ms.
    ///
    /// Producers wake the owning thread on every push, so this mostly bounds how often
    /// [`Consumer::nothing_to_consume`] runs.
    pub fn consume_cycle(mut self, consume_cycle: Duration) -> Self {
        assert!(consume_cycle > Duration::ZERO, "consume_cycle must not be zero");
        self.consume_cycle = consume_cycle;
        self
    }

    /// How long threads keep draining after shutdown starts. Defaults to 30 seconds.
    pub fn shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        assert!(shutdown_timeout > Duration::ZERO, "shutdown_timeout must not be zero");
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Build an idle pool. Attach carriers with [`ConsumerPool::attach`], then
    /// [`ConsumerPool::start`] it.
    pub fn build(self) -> ConsumerPool {
        ConsumerPool {
            config: self,
            attachments: Vec::new(),
        }
    }
}

// Type-erased carrier + consumer pair, so one pool can serve carriers of different item types.
trait Attachment: Send + Sync {
    fn channels(&self) -> usize;
    fn bind(&self, owners: Vec<Unparker>);
    fn drain(&self, channel: usize, batch_size: usize) -> usize;
    fn idle(&self);
    fn close(&self);
    fn exit(&self);
}

struct Attached<T> {
    carrier: Carrier<T>,
    consumer: Arc<dyn Consumer<T>>,
}

impl<T: Send + 'static> Attachment for Attached<T> {
    fn channels(&self) -> usize {
        self.carrier.channels()
    }

    fn bind(&self, owners: Vec<Unparker>) {
        self.carrier.bind(Arc::clone(&self.consumer), owners);
    }

    fn drain(&self, channel: usize, batch_size: usize) -> usize {
        let mut batch = Vec::new();
        let mut drained = 0;
        // one batch at a time until empty; a full queue refills while we work
        loop {
            self.carrier.pop_batch(channel, &mut batch, batch_size);
            if batch.is_empty() {
                return drained;
            }
            let count = run_batch(&*self.consumer, &mut batch, self.carrier.name());
            self.carrier.finish_batch(count);
            drained += count;
            if count < batch_size {
                return drained;
            }
        }
    }

    fn idle(&self) {
        self.consumer.nothing_to_consume();
    }

    fn close(&self) {
        self.carrier.close();
    }

    fn exit(&self) {
        self.consumer.on_exit();
    }
}

/// A fixed set of threads draining one or more [`Carrier`]s.
///
/// Each channel of each attached carrier is owned by exactly one thread, assigned round-robin
/// across all channels of all carriers. Items of one channel are therefore never processed
/// concurrently.
pub struct ConsumerPool {
    config: ConsumerPoolBuilder,
    attachments: Vec<Arc<dyn Attachment>>,
}

impl ConsumerPool {
    /// Drain `carrier` into `consumer` once the pool starts.
    ///
    /// # Panics
    ///
    /// Panics on start if `carrier` is already attached to another pool.
    pub fn attach<T: Send + 'static>(&mut self, carrier: &Carrier<T>, consumer: impl Consumer<T>) {
        self.attach_shared(carrier, Arc::new(consumer));
    }

    /// Like [`Self::attach`], for a consumer that is also referenced elsewhere.
    pub fn attach_shared<T: Send + 'static>(
        &mut self,
        carrier: &Carrier<T>,
        consumer: Arc<dyn Consumer<T>>,
    ) {
        self.attachments.push(Arc::new(Attached {
            carrier: carrier.clone(),
            consumer,
        }));
    }

    /// Spawn the pool threads.
    ///
    /// Returns a [`ConsumerPoolHandle`] that drains and stops the pool when dropped.
    pub fn start(self) -> io::Result<ConsumerPoolHandle> {
        let ConsumerPoolBuilder {
            name,
            threads,
            batch_size,
            consume_cycle,
            shutdown_timeout,
        } = self.config;

        let parkers: Vec<Parker> = (0..threads).map(|_| Parker::new()).collect();
        let unparkers: Vec<Unparker> = parkers.iter().map(|p| p.unparker().clone()).collect();
        let mut owned: Vec<Vec<(usize, usize)>> = vec![Vec::new(); threads];
        let mut next = 0;
        for (index, attachment) in self.attachments.iter().enumerate() {
            let owners = (0..attachment.channels())
                .map(|channel| {
                    let thread = next % threads;
                    next += 1;
                    owned[thread].push((index, channel));
                    unparkers[thread].clone()
                })
                .collect();
            attachment.bind(owners);
        }

        let attachments: Arc<[Arc<dyn Attachment>]> = self.attachments.into();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handle = ConsumerPoolHandle {
            name: name.clone(),
            threads: Vec::with_capacity(threads),
            shutdown: Arc::clone(&shutdown),
            unparkers,
            attachments: Arc::clone(&attachments),
        };
        for (index, (parker, owned)) in parkers.into_iter().zip(owned).enumerate() {
            let worker = PoolThread {
                pool: name.clone(),
                index,
                attachments: Arc::clone(&attachments),
                owned,
                parker,
                batch_size,
                consume_cycle,
                shutdown_timeout,
                shutdown: Arc::clone(&shutdown),
            };
            // on error, dropping `handle` stops the threads spawned so far
            let thread = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker.run())?;
            handle.threads.push(thread);
        }
        tracing::info!(pool = %name, threads, carriers = attachments.len(), "consumer pool started");
        Ok(handle)
    }
}

struct PoolThread {
    pool: String,
    index: usize,
    attachments: Arc<[Arc<dyn Attachment>]>,
    // (attachment, channel) pairs owned by this thread
    owned: Vec<(usize, usize)>,
    parker: Parker,
    batch_size: usize,
    consume_cycle: Duration,
    shutdown_timeout: Duration,
    shutdown: Arc<AtomicBool>,
}

impl PoolThread {
    fn run(self) {
        let span = tracing::span!(tracing::Level::TRACE, "strata consumer pool", pool = %self.pool, thread = self.index);
        let _enter = span.enter();
        let idle_targets: BTreeSet<usize> = self.owned.iter().map(|(index, _)| *index).collect();
        loop {
            let drained = self.drain_owned();
            if self.shutdown.load(Ordering::Acquire) {
                return self.shut_down();
            }
            if drained == 0 {
                for index in &idle_targets {
                    self.attachments[*index].idle();
                }
                self.parker.park_timeout(self.consume_cycle);
            }
        }
    }

    fn drain_owned(&self) -> usize {
        self.owned
            .iter()
            .map(|(index, channel)| self.attachments[*index].drain(*channel, self.batch_size))
            .sum()
    }

    fn shut_down(self) {
        let deadline = Instant::now() + self.shutdown_timeout;
        while self.drain_owned() > 0 {
            if Instant::now() >= deadline {
                tracing::warn!(pool = %self.pool, "unable to drain carriers while shutting down");
                return;
            }
        }
    }
}

/// Guard that, when dropped, closes the attached carriers, lets the pool threads drain what is
/// left, and joins them.
pub struct ConsumerPoolHandle {
    name: String,
    threads: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    unparkers: Vec<Unparker>,
    attachments: Arc<[Arc<dyn Attachment>]>,
}

impl ConsumerPoolHandle {
    /// Alias for `drop(handle)`.
    pub fn shut_down(self) {}
}

impl Drop for ConsumerPoolHandle {
    fn drop(&mut self) {
        for attachment in self.attachments.iter() {
            attachment.close();
        }
        self.shutdown.store(true, Ordering::Release);
        for unparker in &self.unparkers {
            unparker.unpark();
        }
        tracing::info!(pool = %self.name, "awaiting consumer pool shutdown");
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                tracing::error!(pool = %self.name, "consumer pool thread panicked");
            }
        }
        for attachment in self.attachments.iter() {
            attachment.exit();
        }
        tracing::info!(pool = %self.name, "consumer pool shut down");
    }
}
