// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use smallvec::SmallVec;

use crate::{
    accumulate::{Accumulator, Add, BucketCounts, NonOp},
    fields::{FieldError, FromStorageFields, StorageFields, ToStorageFields},
    identity::MetricId,
    metrics::{Downsample, Metrics},
    time_bucket::Downsampling,
};

/// Percentile ranks computed by [`PercentileMetrics`].
pub const RANKS: [u8; 5] = [50, 75, 90, 95, 99];

const PRECISION: &str = "precision";
const DATASET: &str = "dataset";

/// Percentiles over values bucketed at a fixed precision (for example latencies at 10ms).
///
/// Partials recorded at different precisions can't be merged; combining them is abandoned.
#[derive(Clone, Debug, PartialEq)]
pub struct PercentileMetrics {
    id: MetricId,
    precision: Accumulator<u64, NonOp>,
    dataset: Accumulator<BucketCounts, Add>,
    percentiles: SmallVec<[u64; 5]>,
}

impl PercentileMetrics {
    /// An empty partial bucketing at `precision`.
    pub fn new(id: MetricId, precision: u64) -> Self {
        Self {
            id,
            precision: Accumulator::new(precision.max(1)),
            dataset: Accumulator::default(),
            percentiles: SmallVec::new(),
        }
    }

    /// Count one observation.
    pub fn record(&mut self, value: u64) {
        let precision = self.precision();
        let mut single = BucketCounts::default();
        single.record(value, precision);
        self.dataset.record(single);
    }

    /// Bucket width.
    pub fn precision(&self) -> u64 {
        *self.precision.value()
    }

    /// Number of observations.
    pub fn count(&self) -> u64 {
        self.dataset.value().total()
    }

    /// The value at `rank` (one of [`RANKS`]) as of the last [`Metrics::calculate`].
    pub fn percentile(&self, rank: u8) -> Option<u64> {
        let index = RANKS.iter().position(|r| *r == rank)?;
        self.percentiles.get(index).copied()
    }
}

impl Metrics for PercentileMetrics {
    fn id(&self) -> &MetricId {
        &self.id
    }

    fn combine(&mut self, other: &Self) -> bool {
        if other.precision() != self.precision() {
            return false;
        }
        self.precision.merge(&other.precision);
        self.dataset.merge(&other.dataset);
        true
    }

    fn calculate(&mut self) {
        let precision = self.precision();
        let dataset = self.dataset.value();
        self.percentiles = RANKS
            .iter()
            .map(|rank| dataset.percentile(*rank, precision))
            .collect();
    }
}

impl Downsample for PercentileMetrics {
    fn downsample(&self, level: Downsampling) -> Option<Self> {
        Some(Self {
            id: self.id.downsample(level)?,
            precision: self.precision,
            dataset: self.dataset.clone(),
            percentiles: SmallVec::new(),
        })
    }
}

impl ToStorageFields for PercentileMetrics {
    fn to_storage_fields(&self) -> StorageFields {
        let mut fields = StorageFields::new()
            .with(PRECISION, self.precision() as i64)
            .with(DATASET, self.dataset.value());
        for (rank, value) in RANKS.iter().zip(&self.percentiles) {
            fields.insert(format!("p{rank}"), *value as i64);
        }
        fields
    }
}

impl FromStorageFields for PercentileMetrics {
    fn from_storage_fields(id: MetricId, fields: &StorageFields) -> Result<Self, FieldError> {
        let precision = u64::try_from(fields.long(PRECISION)?).unwrap_or(1);
        let mut metrics = Self::new(id, precision);
        metrics.dataset = Accumulator::new(fields.buckets(DATASET)?);
        metrics.calculate();
        Ok(metrics)
    }
}
