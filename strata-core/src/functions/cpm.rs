// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    accumulate::{Accumulator, Add},
    fields::{FieldError, FromStorageFields, StorageFields, ToStorageFields},
    identity::MetricId,
    metrics::{Downsample, Metrics},
    time_bucket::Downsampling,
};

const TOTAL: &str = "total";
const VALUE: &str = "value";

/// Calls per minute: a call count averaged over the minutes in the record's bucket.
#[derive(Clone, Debug, PartialEq)]
pub struct CpmMetrics {
    id: MetricId,
    total: Accumulator<i64, Add>,
    value: i64,
}

impl CpmMetrics {
    /// A partial counting `calls` calls.
    pub fn new(id: MetricId, calls: i64) -> Self {
        Self {
            id,
            total: Accumulator::new(calls),
            value: 0,
        }
    }

    /// Total calls in the bucket.
    pub fn total(&self) -> i64 {
        *self.total.value()
    }

    /// Calls per minute, as of the last [`Metrics::calculate`].
    pub fn value(&self) -> i64 {
        self.value
    }
}

impl Metrics for CpmMetrics {
    fn id(&self) -> &MetricId {
        &self.id
    }

    fn combine(&mut self, other: &Self) -> bool {
        self.total.merge(&other.total);
        true
    }

    fn calculate(&mut self) {
        self.value = self.total() / self.id.time_bucket().span_minutes().max(1);
    }
}

impl Downsample for CpmMetrics {
    fn downsample(&self, level: Downsampling) -> Option<Self> {
        Some(Self {
            id: self.id.downsample(level)?,
            total: self.total,
            value: 0,
        })
    }
}

impl ToStorageFields for CpmMetrics {
    fn to_storage_fields(&self) -> StorageFields {
        StorageFields::new()
            .with(TOTAL, self.total())
            .with(VALUE, self.value)
    }
}

impl FromStorageFields for CpmMetrics {
    fn from_storage_fields(id: MetricId, fields: &StorageFields) -> Result<Self, FieldError> {
        Ok(Self {
            id,
            total: Accumulator::new(fields.long(TOTAL)?),
            value: fields.long(VALUE)?,
        })
    }
}
