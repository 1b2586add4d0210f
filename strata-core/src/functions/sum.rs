// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    accumulate::{Accumulator, Add},
    fields::{FieldError, FromStorageFields, StorageFields, ToStorageFields},
    identity::MetricId,
    metrics::{Downsample, Metrics},
    time_bucket::Downsampling,
};

const VALUE: &str = "value";

/// Plain sum of observed values.
#[derive(Clone, Debug, PartialEq)]
pub struct SumMetrics {
    id: MetricId,
    value: Accumulator<i64, Add>,
}

impl SumMetrics {
    /// A partial holding `value`.
    pub fn new(id: MetricId, value: i64) -> Self {
        Self {
            id,
            value: Accumulator::new(value),
        }
    }

    /// The sum so far.
    pub fn value(&self) -> i64 {
        *self.value.value()
    }
}

impl Metrics for SumMetrics {
    fn id(&self) -> &MetricId {
        &self.id
    }

    fn combine(&mut self, other: &Self) -> bool {
        self.value.merge(&other.value);
        true
    }

    fn calculate(&mut self) {}
}

impl Downsample for SumMetrics {
    fn downsample(&self, level: Downsampling) -> Option<Self> {
        Some(Self {
            id: self.id.downsample(level)?,
            value: self.value,
        })
    }
}

impl ToStorageFields for SumMetrics {
    fn to_storage_fields(&self) -> StorageFields {
        StorageFields::new().with(VALUE, self.value())
    }
}

impl FromStorageFields for SumMetrics {
    fn from_storage_fields(id: MetricId, fields: &StorageFields) -> Result<Self, FieldError> {
        Ok(Self::new(id, fields.long(VALUE)?))
    }
}
