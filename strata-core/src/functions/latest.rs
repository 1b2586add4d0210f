// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    accumulate::{Accumulator, LatestWins},
    fields::{FieldError, FromStorageFields, StorageFields, ToStorageFields},
    identity::MetricId,
    metrics::{Downsample, Metrics},
    time_bucket::Downsampling,
};

const VALUE: &str = "value";
const OBSERVED_AT: &str = "observed_at";

/// Most recent observation of a gauge-like value.
///
/// Each partial carries the epoch millis it was observed at. A partial older than the record it
/// is combined into is abandoned, so a late partial never rolls the value back.
#[derive(Clone, Debug, PartialEq)]
pub struct LatestMetrics {
    id: MetricId,
    value: Accumulator<i64, LatestWins>,
    observed_at: Accumulator<i64, LatestWins>,
}

impl LatestMetrics {
    /// A partial observing `value` at `observed_at` epoch millis.
    pub fn new(id: MetricId, value: i64, observed_at: i64) -> Self {
        Self {
            id,
            value: Accumulator::new(value),
            observed_at: Accumulator::new(observed_at),
        }
    }

    /// The latest value.
    pub fn value(&self) -> i64 {
        *self.value.value()
    }

    /// When the latest value was observed.
    pub fn observed_at(&self) -> i64 {
        *self.observed_at.value()
    }
}

impl Metrics for LatestMetrics {
    fn id(&self) -> &MetricId {
        &self.id
    }

    fn combine(&mut self, other: &Self) -> bool {
        if other.observed_at() < self.observed_at() {
            return false;
        }
        self.value.merge(&other.value);
        self.observed_at.merge(&other.observed_at);
        true
    }

    fn calculate(&mut self) {}
}

impl Downsample for LatestMetrics {
    fn downsample(&self, level: Downsampling) -> Option<Self> {
        Some(Self {
            id: self.id.downsample(level)?,
            value: self.value,
            observed_at: self.observed_at,
        })
    }
}

impl ToStorageFields for LatestMetrics {
    fn to_storage_fields(&self) -> StorageFields {
        StorageFields::new()
            .with(VALUE, self.value())
            .with(OBSERVED_AT, self.observed_at())
    }
}

impl FromStorageFields for LatestMetrics {
    fn from_storage_fields(id: MetricId, fields: &StorageFields) -> Result<Self, FieldError> {
        Ok(Self::new(id, fields.long(VALUE)?, fields.long(OBSERVED_AT)?))
    }
}
