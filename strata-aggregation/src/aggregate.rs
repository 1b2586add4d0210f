// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! First level aggregation in front of persistence.
//!
//! Raw records arrive at a high rate, often many per identity per second. An [`AggregateWorker`]
//! merges them in memory and forwards one merged record per identity every flush period, so the
//! persistence stage sees a fraction of the raw traffic.

use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

use strata_carrier::{Carrier, CarrierBuilder, ConsumeError, Consumer, ConsumerPool, ProduceError};
use strata_core::{Metrics, Model, TimeSource, Worker};

use crate::buffer::MergeableBuffer;

/// Builder for [`AggregateWorker`].
pub struct AggregateWorkerBuilder<M> {
    model: Model,
    next: Arc<dyn Worker<M>>,
    flush_period: Duration,
    time_source: TimeSource,
    carrier: Option<Carrier<M>>,
}

impl<M: Metrics> AggregateWorkerBuilder<M> {
    /// How often merged records are forwarded. Defaults to 500ms.
    pub fn flush_period(mut self, flush_period: Duration) -> Self {
        self.flush_period = flush_period;
        self
    }

    /// Clock deciding when a flush is due. Defaults to the system clock.
    pub fn time_source(mut self, time_source: TimeSource) -> Self {
        self.time_source = time_source;
        self
    }

    /// Ingestion carrier. Defaults to a carrier named after the model with 1000 slots.
    pub fn carrier(mut self, carrier: Carrier<M>) -> Self {
        self.carrier = Some(carrier);
        self
    }

    /// Build the worker and attach its consumer to `pool`.
    pub fn build(self, pool: &mut ConsumerPool) -> AggregateWorker<M> {
        let name = format!("{}_l1", self.model.storage_name());
        let carrier = self
            .carrier
            .unwrap_or_else(|| CarrierBuilder::new().name(name.clone()).channel_size(1000).build());
        let shared = Arc::new(Shared {
            buffer: MergeableBuffer::new(),
            flush_period: i64::try_from(self.flush_period.as_millis()).unwrap_or(i64::MAX),
            last_flush: AtomicI64::new(self.time_source.now_millis()),
            aggregated: AtomicU64::new(0),
            name,
            model: self.model,
            next: self.next,
            time_source: self.time_source,
        });
        pool.attach(&carrier, L1Consumer(shared.clone()));
        AggregateWorker { shared, carrier }
    }
}

struct Shared<M> {
    name: String,
    model: Model,
    buffer: MergeableBuffer<M>,
    next: Arc<dyn Worker<M>>,
    flush_period: i64,
    time_source: TimeSource,
    last_flush: AtomicI64,
    aggregated: AtomicU64,
}

impl<M: Metrics> Shared<M> {
    fn flush_if_due(&self) {
        let now = self.time_source.now_millis();
        let last = self.last_flush.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.flush_period {
            return;
        }
        // several pool threads may find the flush due, one of them runs it
        if self
            .last_flush
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.flush();
        }
    }

    fn flush(&self) {
        for metrics in self.buffer.drain() {
            self.next.accept(metrics);
        }
        let aggregated = self.aggregated.swap(0, Ordering::Relaxed);
        if aggregated > 0 {
            metrics_024::counter!(
                "strata_metrics_aggregation",
                "metric" => self.model.name().to_owned(),
                "level" => "1",
                "dimensionality" => self.model.downsampling().name(),
            )
            .increment(aggregated);
        }
    }
}

struct L1Consumer<M>(Arc<Shared<M>>);

impl<M: Metrics> Consumer<M> for L1Consumer<M> {
    fn consume(&self, batch: &mut Vec<M>) -> Result<(), ConsumeError> {
        for metrics in batch.drain(..) {
            self.0.buffer.accept(metrics);
        }
        self.0.flush_if_due();
        Ok(())
    }

    fn nothing_to_consume(&self) {
        self.0.flush_if_due();
    }

    fn on_exit(&self) {
        self.0.flush();
    }
}

/// Merges raw records per identity and forwards them to the next stage periodically.
pub struct AggregateWorker<M> {
    shared: Arc<Shared<M>>,
    carrier: Carrier<M>,
}

impl<M: Metrics> AggregateWorker<M> {
    /// Start building a worker for `model` that forwards merged records to `next`.
    pub fn builder(model: Model, next: Arc<dyn Worker<M>>) -> AggregateWorkerBuilder<M> {
        AggregateWorkerBuilder {
            model,
            next,
            flush_period: Duration::from_millis(500),
            time_source: TimeSource::default(),
            carrier: None,
        }
    }

    /// Enqueue `metrics`, handing it back if the carrier rejects it.
    pub fn try_accept(&self, metrics: M) -> Result<(), ProduceError<M>> {
        self.carrier.produce(metrics)?;
        self.shared.aggregated.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Forward everything merged so far, without waiting for the flush period.
    pub fn flush(&self) {
        self.shared.flush();
    }

    /// Records merged and not forwarded yet.
    pub fn pending(&self) -> usize {
        self.shared.buffer.len()
    }

    /// The ingestion carrier.
    pub fn carrier(&self) -> &Carrier<M> {
        &self.carrier
    }
}

impl<M: Metrics> Worker<M> for AggregateWorker<M> {
    fn accept(&self, metrics: M) {
        if let Err(err) = self.try_accept(metrics) {
            strata_carrier::rate_limited!(
                Duration::from_secs(1),
                tracing::error!(worker = %self.shared.name, "dropping record: {err}")
            );
        }
    }
}
