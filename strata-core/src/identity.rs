// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Metric identities.

use std::{
    fmt::{self, Write},
    sync::Arc,
};

use smallvec::SmallVec;

use crate::time_bucket::{Downsampling, TimeBucket};

/// The entity part of a [`MetricId`]: an ordered list of dimension values such as
/// `["checkout", "instance-1"]`.
///
/// Cloning is cheap, the dimension strings are shared.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(SmallVec<[Arc<str>; 2]>);

impl EntityId {
    /// Build an entity from its dimension values, in order.
    pub fn new<D: Into<Arc<str>>>(dimensions: impl IntoIterator<Item = D>) -> Self {
        Self(dimensions.into_iter().map(Into::into).collect())
    }

    /// An entity with a single dimension.
    pub fn single(dimension: impl Into<Arc<str>>) -> Self {
        Self(SmallVec::from_iter([dimension.into()]))
    }

    /// The dimension values.
    pub fn dimensions(&self) -> &[Arc<str>] {
        &self.0
    }
}

/// Dimensions joined with `.`. A `.` or `\` inside a dimension is escaped with `\`, so distinct
/// entities never render the same.
impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, dimension) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            let mut rest: &str = dimension;
            while let Some(at) = rest.find(['.', '\\']) {
                f.write_str(&rest[..at])?;
                f.write_char('\\')?;
                f.write_str(&rest[at..at + 1])?;
                rest = &rest[at + 1..];
            }
            f.write_str(rest)?;
        }
        Ok(())
    }
}

/// Identity of one aggregate row: entity dimensions plus time bucket.
///
/// Equality and hashing cover the whole composite, so the same entity in two buckets (or in the
/// same instant at two downsampling levels) are two distinct identities.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricId {
    entity: EntityId,
    time_bucket: TimeBucket,
}

impl MetricId {
    /// Create an identity.
    pub fn new(entity: EntityId, time_bucket: TimeBucket) -> Self {
        Self {
            entity,
            time_bucket,
        }
    }

    /// The entity dimensions.
    pub fn entity(&self) -> &EntityId {
        &self.entity
    }

    /// The time bucket.
    pub fn time_bucket(&self) -> TimeBucket {
        self.time_bucket
    }

    /// The identity of the same entity in the enclosing bucket at `level`.
    pub fn downsample(&self, level: Downsampling) -> Option<Self> {
        Some(Self {
            entity: self.entity.clone(),
            time_bucket: self.time_bucket.downsample(level)?,
        })
    }

    /// Row id used by storage backends: `{time_bucket}_{entity}`.
    pub fn storage_id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.time_bucket, self.entity)
    }
}
