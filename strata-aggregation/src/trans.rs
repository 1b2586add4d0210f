// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Downsampling of minute records into coarser levels.

use std::{fmt, sync::Arc};

use strata_core::{Downsample, Downsampling, Worker};

/// Copies every record into the worker of each coarser level it was configured with.
///
/// Fed with the drained records of a minute level persistence round. The coarser workers merge
/// the copies in their own windows and persist them on their own, less frequent, rounds.
pub struct TransWorker<M> {
    targets: Vec<(Downsampling, Arc<dyn Worker<M>>)>,
}

impl<M> Default for TransWorker<M> {
    fn default() -> Self {
        Self { targets: vec![] }
    }
}

impl<M> fmt::Debug for TransWorker<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.targets.iter().map(|(level, _)| level))
            .finish()
    }
}

impl<M: Downsample> TransWorker<M> {
    /// A worker without targets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also forward a copy of each record, downsampled to `level`, to `worker`.
    pub fn with_target(mut self, level: Downsampling, worker: Arc<dyn Worker<M>>) -> Self {
        self.targets.push((level, worker));
        self
    }

    /// Configured levels, in registration order.
    pub fn levels(&self) -> impl Iterator<Item = Downsampling> + '_ {
        self.targets.iter().map(|(level, _)| *level)
    }
}

impl<M: Downsample> Worker<M> for TransWorker<M> {
    fn accept(&self, metrics: M) {
        for (level, worker) in &self.targets {
            if let Some(downsampled) = metrics.downsample(*level) {
                worker.accept(downsampled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert2::check;
    use strata_core::{EntityId, MetricId, Metrics, TimeBucket, functions::SumMetrics};

    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<SumMetrics>>);

    impl Worker<SumMetrics> for Collect {
        fn accept(&self, metrics: SumMetrics) {
            self.0.lock().unwrap().push(metrics);
        }
    }

    #[test]
    fn forwards_one_copy_per_level() {
        let hour = Arc::new(Collect::default());
        let month = Arc::new(Collect::default());
        let trans = TransWorker::<SumMetrics>::new()
            .with_target(Downsampling::Hour, hour.clone())
            .with_target(Downsampling::Month, month.clone());

        let minute = TimeBucket::new(202402291245, Downsampling::Minute).unwrap();
        trans.accept(SumMetrics::new(MetricId::new(EntityId::single("svc"), minute), 3));

        let hour = hour.0.lock().unwrap();
        check!(hour.len() == 1);
        check!(hour[0].time_bucket().value() == 2024022912);
        check!(hour[0].value() == 3);
        check!(month.0.lock().unwrap()[0].time_bucket().value() == 202402);
    }
}
