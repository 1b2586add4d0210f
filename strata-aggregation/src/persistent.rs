// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Periodic persistence of aggregated records.
//!
//! A [`PersistentWorker`] absorbs records of one metric [`Model`] into a double-buffered
//! [`Window`]. Every round it drains the window, resolves each drained identity against the
//! [`SessionCache`] (loading misses from storage), and turns each record into an insert or an
//! update request. The round driver executes the requests and then calls
//! [`PersistenceWorker::end_of_round`], which evicts stale session cache entries.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use strata_carrier::{Carrier, CarrierBuilder, ConsumeError, Consumer, ConsumerPool, ProduceError};
use strata_core::{MetricId, Metrics, Model, TimeSource, Worker};

use crate::{
    dao::{BatchDao, MetricsDao, StorageError},
    export::{EventKind, Fanout, MetricsConsumer},
    request::PrepareRequest,
    session::{SessionCache, SessionCacheCallback},
    window::Window,
};

/// A worker driven by persistence rounds.
///
/// Object safe, so a round driver can hold workers of different metric types.
pub trait PersistenceWorker: Send + Sync {
    /// Name used in logs and counters.
    fn name(&self) -> &str;

    /// Drain this round's records and prepare their storage writes.
    ///
    /// Returns nothing on rounds this worker skips.
    fn build_batch_requests(&self) -> Vec<PrepareRequest>;

    /// Called once per round after the round's requests were executed.
    fn end_of_round(&self);

    /// Run one complete round against `batch`: prepare, execute, then end the round.
    ///
    /// Returns the number of executed requests. The round is ended even when the flush fails.
    fn run_round(&self, batch: &dyn BatchDao) -> Result<usize, StorageError> {
        let requests = self.build_batch_requests();
        let count = requests.len();
        let flushed = if requests.is_empty() {
            Ok(())
        } else {
            batch.flush(requests)
        };
        self.end_of_round();
        flushed.map(|()| count)
    }
}

impl<W: PersistenceWorker + ?Sized> PersistenceWorker for Arc<W> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn build_batch_requests(&self) -> Vec<PrepareRequest> {
        (**self).build_batch_requests()
    }

    fn end_of_round(&self) {
        (**self).end_of_round()
    }
}

/// Builder for [`PersistentWorker`].
pub struct PersistentWorkerBuilder<M> {
    model: Model,
    dao: Arc<dyn MetricsDao<M>>,
    session_timeout: Duration,
    persistent_mod: u64,
    max_batch_get_size: usize,
    ttl_days: u32,
    time_source: TimeSource,
    consumers: Fanout<M>,
    next: Option<Arc<dyn Worker<M>>>,
}

impl<M: Metrics> PersistentWorkerBuilder<M> {
    /// A builder for the worker persisting `model` through `dao`.
    pub fn new(model: Model, dao: Arc<dyn MetricsDao<M>>) -> Self {
        Self {
            model,
            dao,
            session_timeout: Duration::from_secs(70),
            persistent_mod: 1,
            max_batch_get_size: 2000,
            ttl_days: 7,
            time_source: TimeSource::default(),
            consumers: Fanout::new(),
            next: None,
        }
    }

    /// How long an identity stays in the session cache without being touched.
    ///
    /// Defaults to 70 seconds.
    pub fn session_timeout(mut self, session_timeout: Duration) -> Self {
        self.session_timeout = session_timeout;
        self
    }

    /// Only drain on every `persistent_mod`th round. Defaults to 1, draining every round.
    pub fn persistent_mod(mut self, persistent_mod: u64) -> Self {
        assert!(persistent_mod > 0, "persistent_mod must be positive");
        self.persistent_mod = persistent_mod;
        self
    }

    /// Maximum number of drained records resolved against storage per load. Defaults to 2000.
    pub fn max_batch_get_size(mut self, max_batch_get_size: usize) -> Self {
        assert!(max_batch_get_size > 0, "max_batch_get_size must be positive");
        self.max_batch_get_size = max_batch_get_size;
        self
    }

    /// Storage retention in days, used to detect cached rows storage already deleted.
    /// Defaults to 7.
    pub fn ttl_days(mut self, ttl_days: u32) -> Self {
        self.ttl_days = ttl_days;
        self
    }

    /// Clock used for round timestamps. Defaults to the system clock.
    pub fn time_source(mut self, time_source: TimeSource) -> Self {
        self.time_source = time_source;
        self
    }

    /// Send persisted records to `consumer` as well.
    ///
    /// Alarm consumers typically only take [`EventKind::Total`], exporters take both kinds.
    pub fn consumer(mut self, consumer: impl MetricsConsumer<M> + 'static) -> Self {
        self.consumers.register(consumer);
        self
    }

    /// Forward every drained record to `next` after processing it, e.g. a downsampling worker.
    pub fn next(mut self, next: Arc<dyn Worker<M>>) -> Self {
        self.next = Some(next);
        self
    }

    /// A worker whose producers write straight into the aggregation window.
    pub fn build(self) -> PersistentWorker<M> {
        self.build_with(Ingest::Direct)
    }

    /// A worker whose producers go through a [`Carrier`] consumed by `pool`.
    ///
    /// The carrier is named after the model and uses the [`CarrierBuilder`] defaults.
    pub fn build_queued(self, pool: &mut ConsumerPool) -> PersistentWorker<M> {
        let carrier = CarrierBuilder::new().name(self.model.storage_name()).build();
        self.build_with_carrier(carrier, pool)
    }

    /// A worker whose producers go through `carrier`, consumed by `pool`.
    pub fn build_with_carrier(self, carrier: Carrier<M>, pool: &mut ConsumerPool) -> PersistentWorker<M> {
        let worker = self.build_with(Ingest::Queued(carrier.clone()));
        pool.attach(
            &carrier,
            WindowWriter {
                window: worker.window.clone(),
            },
        );
        worker
    }

    fn build_with(self, ingest: Ingest<M>) -> PersistentWorker<M> {
        PersistentWorker {
            name: self.model.storage_name(),
            model: self.model,
            dao: self.dao,
            window: Arc::new(Window::new()),
            cache: Arc::new(SessionCache::new()),
            session_timeout: self.session_timeout,
            persistent_mod: self.persistent_mod,
            max_batch_get_size: self.max_batch_get_size,
            ttl_days: self.ttl_days,
            time_source: self.time_source,
            consumers: self.consumers,
            next: self.next,
            ingest,
            round: AtomicU64::new(0),
            aggregated: AtomicU64::new(0),
        }
    }
}

enum Ingest<M> {
    Direct,
    Queued(Carrier<M>),
}

struct WindowWriter<M> {
    window: Arc<Window<M>>,
}

impl<M: Metrics> Consumer<M> for WindowWriter<M> {
    fn consume(&self, batch: &mut Vec<M>) -> Result<(), ConsumeError> {
        for metrics in batch.drain(..) {
            self.window.write(metrics);
        }
        Ok(())
    }
}

/// Persists the records of one metric model. See the [module docs](self).
pub struct PersistentWorker<M> {
    name: String,
    model: Model,
    dao: Arc<dyn MetricsDao<M>>,
    window: Arc<Window<M>>,
    cache: Arc<SessionCache<M>>,
    session_timeout: Duration,
    persistent_mod: u64,
    max_batch_get_size: usize,
    ttl_days: u32,
    time_source: TimeSource,
    consumers: Fanout<M>,
    next: Option<Arc<dyn Worker<M>>>,
    ingest: Ingest<M>,
    round: AtomicU64,
    aggregated: AtomicU64,
}

impl<M> fmt::Debug for PersistentWorker<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentWorker")
            .field("model", &self.model)
            .field("session_timeout", &self.session_timeout)
            .field("persistent_mod", &self.persistent_mod)
            .field("round", &self.round.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<M: Metrics> PersistentWorker<M> {
    /// Start building a worker for `model`.
    pub fn builder(model: Model, dao: Arc<dyn MetricsDao<M>>) -> PersistentWorkerBuilder<M> {
        PersistentWorkerBuilder::new(model, dao)
    }

    /// Absorb `metrics`, handing it back if the ingestion carrier rejects it.
    pub fn try_accept(&self, metrics: M) -> Result<(), ProduceError<M>> {
        match &self.ingest {
            Ingest::Direct => self.window.write(metrics),
            Ingest::Queued(carrier) => carrier.produce(metrics)?,
        }
        self.aggregated.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// The persisted model.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// The session cache, shared with the write callbacks this worker hands out.
    pub fn session_cache(&self) -> &Arc<SessionCache<M>> {
        &self.cache
    }

    /// Records written to the active window and not drained yet.
    pub fn pending(&self) -> usize {
        self.window.pending()
    }

    /// The ingestion carrier, for workers built with one.
    pub fn carrier(&self) -> Option<&Carrier<M>> {
        match &self.ingest {
            Ingest::Direct => None,
            Ingest::Queued(carrier) => Some(carrier),
        }
    }

    /// Number of rounds seen so far, skipped ones included.
    pub fn rounds(&self) -> u64 {
        self.round.load(Ordering::Relaxed)
    }

    fn prepare_batch(&self, batch: Vec<M>, now: i64, requests: &mut Vec<PrepareRequest>) {
        let mut failure = self.load_from_storage(&batch, now).err();
        for metrics in batch {
            if failure.is_none() {
                match self.prepare_one(&metrics, now) {
                    Ok(Some(request)) => {
                        requests.push(request);
                        self.consumers.dispatch(&metrics, EventKind::Increment);
                    }
                    Ok(None) => {}
                    Err(err) => failure = Some(err),
                }
            }
            if let Some(next) = &self.next {
                next.accept(metrics);
            }
        }
        if let Some(err) = failure {
            tracing::warn!(model = %self.name, "abandoning batch for this round: {err}");
        }
    }

    // Drop cached rows storage already deleted, then load whatever is not cached.
    fn load_from_storage(&self, batch: &[M], now: i64) -> Result<(), StorageError> {
        let check_ttl = !self.model.time_relative_id() && self.model.support_update();
        let missing: Vec<MetricId> = batch
            .iter()
            .map(Metrics::id)
            .filter(|id| {
                if !check_ttl {
                    return !self.cache.contains(id);
                }
                match self.cache.get(id) {
                    None => true,
                    Some(cached) => {
                        let expired = self.dao.is_expired_cache(&self.model, &cached, now, self.ttl_days);
                        if expired {
                            self.cache.remove(id);
                        }
                        expired
                    }
                }
            })
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        for loaded in self.dao.multi_get(&self.model, &missing)? {
            self.cache.put(loaded, now);
        }
        Ok(())
    }

    fn prepare_one(&self, metrics: &M, now: i64) -> Result<Option<PrepareRequest>, StorageError> {
        match self.cache.get(metrics.id()) {
            Some(mut cached) => {
                // rows of models without update support are final once stored
                if !self.model.support_update() || !cached.combine(metrics) {
                    return Ok(None);
                }
                cached.calculate();
                let callback = SessionCacheCallback::update(self.cache.clone(), cached.clone(), now);
                let request = self.dao.prepare_batch_update(&self.model, &cached, callback)?;
                self.consumers.dispatch(&cached, EventKind::Total);
                self.cache.put(cached, now);
                Ok(Some(request))
            }
            None => {
                let mut inserted = metrics.clone();
                inserted.calculate();
                let callback = SessionCacheCallback::insert(self.cache.clone(), inserted.clone(), now);
                let request = self.dao.prepare_batch_insert(&self.model, &inserted, callback)?;
                self.consumers.dispatch(&inserted, EventKind::Total);
                Ok(Some(request))
            }
        }
    }
}

impl<M: Metrics> Worker<M> for PersistentWorker<M> {
    fn accept(&self, metrics: M) {
        if let Err(err) = self.try_accept(metrics) {
            strata_carrier::rate_limited!(
                Duration::from_secs(1),
                tracing::error!(model = %self.name, "dropping record: {err}")
            );
        }
    }
}

impl<M: Metrics> PersistenceWorker for PersistentWorker<M> {
    fn name(&self) -> &str {
        &self.name
    }

    fn build_batch_requests(&self) -> Vec<PrepareRequest> {
        if self.round.fetch_add(1, Ordering::Relaxed) % self.persistent_mod != 0 {
            return vec![];
        }
        let start = self.time_source.instant();
        let mut drain = self.window.begin_drain();
        let drained = drain.take();
        if drained.is_empty() {
            return vec![];
        }

        let now = self.time_source.now_millis();
        let mut requests = Vec::with_capacity(drained.len());
        let mut drained = drained.into_iter();
        loop {
            let batch: Vec<M> = drained.by_ref().take(self.max_batch_get_size).collect();
            if batch.is_empty() {
                break;
            }
            self.prepare_batch(batch, now, &mut requests);
        }
        drain.end();

        tracing::debug!(
            model = %self.name,
            requests = requests.len(),
            elapsed = ?self.time_source.instant().saturating_duration_since(start),
            "prepared batch requests"
        );
        requests
    }

    fn end_of_round(&self) {
        let now = self.time_source.now_millis();
        let evicted = self.cache.evict_expired(now, self.session_timeout);
        if evicted > 0 {
            tracing::debug!(model = %self.name, evicted, "evicted session cache entries");
        }
        let aggregated = self.aggregated.swap(0, Ordering::Relaxed);
        if aggregated > 0 {
            metrics_024::counter!(
                "strata_metrics_aggregation",
                "metric" => self.model.name().to_owned(),
                "level" => "2",
                "dimensionality" => self.model.downsampling().name(),
            )
            .increment(aggregated);
        }
    }
}
