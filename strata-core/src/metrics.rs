// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The [`Metrics`] record trait.

use std::fmt::Debug;

use crate::{
    fields::{FromStorageFields, ToStorageFields},
    identity::MetricId,
    time_bucket::{Downsampling, TimeBucket},
};

/// A partially aggregated metric record.
///
/// A record's identity never changes after creation. Only its accumulators change, through
/// [`Metrics::combine`], and its derived fields, through [`Metrics::calculate`].
pub trait Metrics:
    ToStorageFields + FromStorageFields + Clone + Debug + Send + Sync + 'static
{
    /// The identity of this record.
    fn id(&self) -> &MetricId;

    /// Shortcut for the time bucket of [`Metrics::id`].
    fn time_bucket(&self) -> TimeBucket {
        self.id().time_bucket()
    }

    /// Fold `other`, a partial with the same identity, into `self` field by field.
    ///
    /// Returns `false` if `other` is a stale or duplicate partial and the merge was abandoned. In
    /// that case `self` must be left unchanged.
    fn combine(&mut self, other: &Self) -> bool;

    /// Recompute derived fields (averages, rates, percentiles) from the accumulators.
    fn calculate(&mut self);
}

/// Records that can be rolled up into coarser time buckets.
pub trait Downsample: Metrics {
    /// A copy of this record re-keyed to the enclosing bucket at `level`, or `None` if `level` is
    /// finer than the record's own bucket.
    ///
    /// Accumulators are carried over unchanged, so merging all the copies of one hour's minute
    /// records yields the hour record.
    fn downsample(&self, level: Downsampling) -> Option<Self>;
}
