// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    accumulate::{Accumulator, Add},
    fields::{FieldError, FromStorageFields, StorageFields, ToStorageFields},
    identity::MetricId,
    metrics::{Downsample, Metrics},
    time_bucket::Downsampling,
};

const SUMMATION: &str = "summation";
const COUNT: &str = "count";
const VALUE: &str = "value";

/// Integer average. Keeps the sum and the count so partials merge exactly.
#[derive(Clone, Debug, PartialEq)]
pub struct LongAvgMetrics {
    id: MetricId,
    summation: Accumulator<i64, Add>,
    count: Accumulator<i64, Add>,
    value: i64,
}

impl LongAvgMetrics {
    /// A partial holding a single observation.
    pub fn new(id: MetricId, observation: i64) -> Self {
        Self::with_count(id, observation, 1)
    }

    /// A partial that already summarizes `count` observations adding up to `summation`.
    pub fn with_count(id: MetricId, summation: i64, count: i64) -> Self {
        Self {
            id,
            summation: Accumulator::new(summation),
            count: Accumulator::new(count),
            value: 0,
        }
    }

    /// Number of observations.
    pub fn count(&self) -> i64 {
        *self.count.value()
    }

    /// Average, as of the last [`Metrics::calculate`].
    pub fn value(&self) -> i64 {
        self.value
    }
}

impl Metrics for LongAvgMetrics {
    fn id(&self) -> &MetricId {
        &self.id
    }

    fn combine(&mut self, other: &Self) -> bool {
        self.summation.merge(&other.summation);
        self.count.merge(&other.count);
        true
    }

    fn calculate(&mut self) {
        let count = self.count();
        if count != 0 {
            self.value = self.summation.value() / count;
        }
    }
}

impl Downsample for LongAvgMetrics {
    fn downsample(&self, level: Downsampling) -> Option<Self> {
        Some(Self {
            id: self.id.downsample(level)?,
            summation: self.summation,
            count: self.count,
            value: 0,
        })
    }
}

impl ToStorageFields for LongAvgMetrics {
    fn to_storage_fields(&self) -> StorageFields {
        StorageFields::new()
            .with(SUMMATION, *self.summation.value())
            .with(COUNT, self.count())
            .with(VALUE, self.value)
    }
}

impl FromStorageFields for LongAvgMetrics {
    fn from_storage_fields(id: MetricId, fields: &StorageFields) -> Result<Self, FieldError> {
        Ok(Self {
            value: fields.long(VALUE)?,
            ..Self::with_count(id, fields.long(SUMMATION)?, fields.long(COUNT)?)
        })
    }
}
