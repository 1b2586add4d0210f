// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wiring of metric models into aggregation and persistence graphs.

use std::{io, sync::Arc};

use strata_aggregation::{
    AggregateWorker, BatchDao, MetricsConsumer, MetricsDao, PersistentWorker,
    PersistentWorkerBuilder, TransWorker,
};
use strata_carrier::{ConsumerPool, ConsumerPoolHandle};
use strata_core::{Downsample, Model, TimeSource};

use crate::{
    config::{ConfigError, PipelineConfig},
    graph::{Graph, GraphBuilder, GraphError, GraphRegistry},
    timer::{PersistenceTimer, PersistenceTimerHandle, RoundSummary},
};

/// Builds one graph per metric model and owns what drives them.
///
/// For a model at level `L`, [`create`](Self::create) wires:
///
/// - `l1`, the root: an [`AggregateWorker`] merging raw records on the consumer pool;
/// - `L`: the base [`PersistentWorker`], persisting every round;
/// - `trans` and one persistent worker per level coarser than `L`, persisting every
///   `downsampling_persistent_mod` rounds.
///
/// Consumers passed to `create` receive the records persisted at every level.
pub struct MetricsStreamProcessor {
    config: PipelineConfig,
    registry: GraphRegistry,
    timer: PersistenceTimer,
    pool: ConsumerPool,
    time_source: TimeSource,
    downsampling_workers: u32,
}

impl MetricsStreamProcessor {
    /// A processor flushing every round through `batch`.
    pub fn new(config: PipelineConfig, batch: Arc<dyn BatchDao>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            timer: PersistenceTimer::new(batch).prepare_threads(config.prepare_threads),
            pool: config.pool.builder("strata-l1").build(),
            registry: GraphRegistry::new(),
            time_source: TimeSource::default(),
            downsampling_workers: 0,
            config,
        })
    }

    /// Clock of every worker created from now on. Defaults to the system clock.
    pub fn time_source(mut self, time_source: TimeSource) -> Self {
        self.time_source = time_source;
        self
    }

    /// Wire `model` into a graph registered under the model name.
    pub fn create<M: Downsample>(
        &mut self,
        model: Model,
        dao: Arc<dyn MetricsDao<M>>,
        consumers: impl IntoIterator<Item = Arc<dyn MetricsConsumer<M>>>,
    ) -> Result<Arc<Graph<M>>, GraphError> {
        if self.registry.contains(model.name()) {
            return Err(GraphError::DuplicateGraph(model.name().to_owned()));
        }
        let consumers: Vec<_> = consumers.into_iter().collect();
        let base = model.downsampling();
        let mut builder = GraphBuilder::<M>::new(model.name());
        let mut persistence = vec![];

        let mut trans = TransWorker::<M>::new();
        let mut coarser = vec![];
        for level in base.coarser() {
            let session_timeout = self.config.downsampling_session_timeout(self.downsampling_workers);
            self.downsampling_workers += 1;
            let worker = Arc::new(
                self.persistent(model.at(level), dao.clone(), &consumers)
                    .session_timeout(session_timeout)
                    .persistent_mod(self.config.downsampling_persistent_mod)
                    .build(),
            );
            let node = builder.shared_node::<M>(level.name(), worker.clone())?;
            trans = trans.with_target(level, node.worker());
            coarser.push(node);
            persistence.push(worker);
        }

        let mut base_worker = self
            .persistent(model.clone(), dao, &consumers)
            .session_timeout(self.config.session_timeout());
        let base_output = (!coarser.is_empty()).then(|| builder.output::<M>(base.name()));
        if let Some(output) = &base_output {
            base_worker = base_worker.next(Arc::new(output.clone()));
        }
        let base_worker = Arc::new(base_worker.build());
        let base_node = builder.shared_node::<M>(base.name(), base_worker.clone())?;
        persistence.insert(0, base_worker);

        if let Some(output) = &base_output {
            let trans_node = builder.node("trans", trans)?;
            builder.connect(output, &trans_node);
            for node in &coarser {
                builder.edge("trans", node.name());
            }
        }

        let l1_output = builder.output::<M>("l1");
        let l1 = AggregateWorker::<M>::builder(model.clone(), Arc::new(l1_output.clone()))
            .flush_period(self.config.l1_flush_period())
            .time_source(self.time_source.clone())
            .carrier(
                self.config
                    .carrier
                    .builder(format!("{}_l1", model.storage_name()))
                    .build(),
            )
            .build(&mut self.pool);
        let l1_node = builder.node("l1", l1)?;
        builder.connect(&l1_output, &base_node);
        builder.root(&l1_node);

        let graph = self.registry.register(builder.build()?)?;
        for worker in persistence {
            self.timer.register(worker);
        }
        tracing::info!(model = %model, stages = ?graph.stages(), "created metrics stream");
        Ok(graph)
    }

    fn persistent<M: Downsample>(
        &self,
        model: Model,
        dao: Arc<dyn MetricsDao<M>>,
        consumers: &[Arc<dyn MetricsConsumer<M>>],
    ) -> PersistentWorkerBuilder<M> {
        consumers.iter().fold(
            PersistentWorker::builder(model, dao)
                .max_batch_get_size(self.config.max_batch_get_size)
                .ttl_days(self.config.metrics_data_ttl_days)
                .time_source(self.time_source.clone()),
            |builder, consumer| builder.consumer(consumer.clone()),
        )
    }

    /// Graphs created so far.
    pub fn registry(&self) -> &GraphRegistry {
        &self.registry
    }

    /// Start the consumer pool. Rounds only run once [`RunningPipeline::start_timer`] is called
    /// or when driven with [`RunningPipeline::run_round`].
    pub fn start(self) -> io::Result<RunningPipeline> {
        Ok(RunningPipeline {
            pool: Some(self.pool.start()?),
            registry: self.registry,
            timer: Arc::new(self.timer),
            timer_handle: None,
            config: self.config,
        })
    }
}

/// A started [`MetricsStreamProcessor`].
pub struct RunningPipeline {
    registry: GraphRegistry,
    timer: Arc<PersistenceTimer>,
    timer_handle: Option<PersistenceTimerHandle>,
    pool: Option<ConsumerPoolHandle>,
    config: PipelineConfig,
}

impl RunningPipeline {
    /// Graphs to inject records into.
    pub fn registry(&self) -> &GraphRegistry {
        &self.registry
    }

    /// The round driver.
    pub fn timer(&self) -> &Arc<PersistenceTimer> {
        &self.timer
    }

    /// Run one persistence round now, on the calling thread.
    pub fn run_round(&self) -> RoundSummary {
        self.timer.run_round()
    }

    /// Run rounds every `persistent_period_ms` on the current tokio runtime. Does nothing if the
    /// timer already runs.
    pub fn start_timer(&mut self) {
        if self.timer_handle.is_none() {
            self.timer_handle = Some(self.timer.clone().start(self.config.persistent_period()));
        }
    }

    /// Stop the timer, drain the first level queues, and persist what is left in one last round.
    pub async fn shut_down(mut self) {
        if let Some(timer) = self.timer_handle.take() {
            timer.shut_down().await;
        }
        let pool = self.pool.take();
        let timer = self.timer.clone();
        let last_round = tokio::task::spawn_blocking(move || {
            drop(pool);
            timer.run_round()
        });
        match last_round.await {
            Ok(summary) => tracing::info!(requests = summary.requests, "pipeline shut down"),
            Err(err) => tracing::error!("final persistence round panicked: {err}"),
        }
    }
}
