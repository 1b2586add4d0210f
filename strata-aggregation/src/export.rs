// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fan-out of persisted records to alarm and export consumers.

use std::{fmt, sync::Arc, time::Duration};

use strata_carrier::{Carrier, ConsumeError, Consumer, ConsumerPool, ProduceError};

/// What a dispatched record represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The partial aggregated in this round only.
    Increment,
    /// The current value of the stored row, after merging this round's partial.
    Total,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Increment => "increment",
            EventKind::Total => "total",
        })
    }
}

/// Receives records once a persistence round has decided on them.
///
/// Called on the round driver's thread, so implementations should hand slow work off, for
/// example through a [`QueuedConsumer`].
pub trait MetricsConsumer<M>: Send + Sync {
    /// Handle one record.
    fn accept(&self, metrics: &M, kind: EventKind);

    /// Whether this consumer wants events of `kind`. Uninterested consumers are skipped.
    fn interested_in(&self, kind: EventKind) -> bool {
        let _ = kind;
        true
    }
}

impl<M, C: MetricsConsumer<M> + ?Sized> MetricsConsumer<M> for Arc<C> {
    fn accept(&self, metrics: &M, kind: EventKind) {
        (**self).accept(metrics, kind)
    }

    fn interested_in(&self, kind: EventKind) -> bool {
        (**self).interested_in(kind)
    }
}

/// Dispatches each record to every registered consumer.
///
/// Consumers are registered while wiring the pipeline; adding one does not touch the stages
/// upstream of it.
pub struct Fanout<M> {
    consumers: Vec<Arc<dyn MetricsConsumer<M>>>,
}

impl<M> Default for Fanout<M> {
    fn default() -> Self {
        Self { consumers: vec![] }
    }
}

impl<M> Clone for Fanout<M> {
    fn clone(&self) -> Self {
        Self {
            consumers: self.consumers.clone(),
        }
    }
}

impl<M> fmt::Debug for Fanout<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fanout")
            .field("consumers", &self.consumers.len())
            .finish()
    }
}

impl<M: 'static> Fanout<M> {
    /// A fan-out without consumers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a consumer.
    pub fn register(&mut self, consumer: impl MetricsConsumer<M> + 'static) {
        self.consumers.push(Arc::new(consumer));
    }

    /// Add a consumer shared with other stages.
    pub fn register_shared(&mut self, consumer: Arc<dyn MetricsConsumer<M>>) {
        self.consumers.push(consumer);
    }

    /// Send `metrics` to every consumer interested in `kind`.
    pub fn dispatch(&self, metrics: &M, kind: EventKind) {
        for consumer in &self.consumers {
            if consumer.interested_in(kind) {
                consumer.accept(metrics, kind);
            }
        }
    }

    /// Number of registered consumers.
    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    /// Whether no consumer is registered.
    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

impl<M: 'static> MetricsConsumer<M> for Fanout<M> {
    fn accept(&self, metrics: &M, kind: EventKind) {
        self.dispatch(metrics, kind);
    }

    fn interested_in(&self, kind: EventKind) -> bool {
        self.consumers.iter().any(|c| c.interested_in(kind))
    }
}

/// Moves consumption off the round driver's thread.
///
/// Records are cloned into a [`Carrier`] and a [`ConsumerPool`] thread calls the wrapped consumer.
/// Export is best effort: records the carrier rejects are logged and dropped.
pub struct QueuedConsumer<M> {
    carrier: Carrier<(M, EventKind)>,
    kinds: [bool; 2],
}

struct Forward<C>(C);

impl<M, C> Consumer<(M, EventKind)> for Forward<C>
where
    M: Send + 'static,
    C: MetricsConsumer<M> + 'static,
{
    fn consume(&self, batch: &mut Vec<(M, EventKind)>) -> Result<(), ConsumeError> {
        for (metrics, kind) in batch.drain(..) {
            self.0.accept(&metrics, kind);
        }
        Ok(())
    }
}

impl<M: Clone + Send + 'static> QueuedConsumer<M> {
    /// Queue records for `consumer` through `carrier`, consumed by `pool`.
    pub fn attach(
        pool: &mut ConsumerPool,
        carrier: Carrier<(M, EventKind)>,
        consumer: impl MetricsConsumer<M> + 'static,
    ) -> Self {
        let kinds = [
            consumer.interested_in(EventKind::Increment),
            consumer.interested_in(EventKind::Total),
        ];
        pool.attach(&carrier, Forward(consumer));
        Self { carrier, kinds }
    }

    /// The underlying carrier.
    pub fn carrier(&self) -> &Carrier<(M, EventKind)> {
        &self.carrier
    }
}

impl<M: Clone + Send + Sync + 'static> MetricsConsumer<M> for QueuedConsumer<M> {
    fn accept(&self, metrics: &M, kind: EventKind) {
        if let Err(err) = self.carrier.produce((metrics.clone(), kind)) {
            if !matches!(err, ProduceError::Closed(_)) {
                strata_carrier::rate_limited!(
                    Duration::from_secs(1),
                    tracing::warn!(carrier = %self.carrier.name(), %kind, "dropping exported record: {err}")
                );
            }
        }
    }

    fn interested_in(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Increment => self.kinds[0],
            EventKind::Total => self.kinds[1],
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert2::check;
    use strata_carrier::ConsumerPoolBuilder;

    use super::*;

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<(u32, EventKind)>>,
        only: Option<EventKind>,
    }

    impl MetricsConsumer<u32> for Collect {
        fn accept(&self, metrics: &u32, kind: EventKind) {
            self.seen.lock().unwrap().push((*metrics, kind));
        }

        fn interested_in(&self, kind: EventKind) -> bool {
            self.only.is_none_or(|only| only == kind)
        }
    }

    #[test]
    fn fanout_respects_interest() {
        let all = Arc::new(Collect::default());
        let totals = Arc::new(Collect {
            only: Some(EventKind::Total),
            ..Default::default()
        });
        let mut fanout = Fanout::new();
        fanout.register(all.clone());
        fanout.register(totals.clone());

        fanout.dispatch(&1, EventKind::Increment);
        fanout.dispatch(&2, EventKind::Total);

        check!(*all.seen.lock().unwrap() == [(1, EventKind::Increment), (2, EventKind::Total)]);
        check!(*totals.seen.lock().unwrap() == [(2, EventKind::Total)]);
    }

    #[test]
    fn queued_consumer_forwards_on_pool_thread() {
        let sink = Arc::new(Collect::default());
        let mut pool = ConsumerPoolBuilder::new().name("export").threads(1).build();
        let queued = QueuedConsumer::attach(&mut pool, Carrier::new("export"), sink.clone());
        let handle = pool.start().unwrap();

        queued.accept(&7, EventKind::Total);
        check!(queued.carrier().wait_idle(Duration::from_secs(5)));
        check!(*sink.seen.lock().unwrap() == [(7, EventKind::Total)]);
        handle.shut_down();
    }
}
