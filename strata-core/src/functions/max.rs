// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    accumulate::{Accumulator, Max},
    fields::{FieldError, FromStorageFields, StorageFields, ToStorageFields},
    identity::MetricId,
    metrics::{Downsample, Metrics},
    time_bucket::Downsampling,
};

const VALUE: &str = "value";

/// Largest observed value.
#[derive(Clone, Debug, PartialEq)]
pub struct MaxLongMetrics {
    id: MetricId,
    value: Accumulator<i64, Max>,
}

impl MaxLongMetrics {
    /// A partial holding `value`.
    pub fn new(id: MetricId, value: i64) -> Self {
        Self {
            id,
            value: Accumulator::new(value),
        }
    }

    /// The maximum so far.
    pub fn value(&self) -> i64 {
        *self.value.value()
    }
}

impl Metrics for MaxLongMetrics {
    fn id(&self) -> &MetricId {
        &self.id
    }

    fn combine(&mut self, other: &Self) -> bool {
        self.value.merge(&other.value);
        true
    }

    fn calculate(&mut self) {}
}

impl Downsample for MaxLongMetrics {
    fn downsample(&self, level: Downsampling) -> Option<Self> {
        Some(Self {
            id: self.id.downsample(level)?,
            value: self.value,
        })
    }
}

impl ToStorageFields for MaxLongMetrics {
    fn to_storage_fields(&self) -> StorageFields {
        StorageFields::new().with(VALUE, self.value())
    }
}

impl FromStorageFields for MaxLongMetrics {
    fn from_storage_fields(id: MetricId, fields: &StorageFields) -> Result<Self, FieldError> {
        Ok(Self::new(id, fields.long(VALUE)?))
    }
}
