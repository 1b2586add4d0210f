// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Storage contracts consumed by the persistence workers.

use std::{error::Error, fmt};

use strata_core::{FieldError, MetricId, Metrics, Model};

use crate::{
    request::{PrepareRequest, RequestKind},
    session::SessionCacheCallback,
};

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// An error talking to the storage backend.
#[derive(Debug)]
#[non_exhaustive]
pub enum StorageError {
    /// A stored row could not be decoded.
    Schema(FieldError),
    /// The backend rejected or failed the call.
    Backend(Box<dyn Error + Send + Sync>),
    /// The backend could not be reached.
    Unavailable(String),
}

impl StorageError {
    /// Wrap a backend error.
    pub fn backend(err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        StorageError::Backend(err.into())
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Schema(err) => write!(f, "stored row does not match its schema: {err}"),
            StorageError::Backend(err) => write!(f, "storage backend error: {err}"),
            StorageError::Unavailable(reason) => write!(f, "storage unavailable: {reason}"),
        }
    }
}

impl Error for StorageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StorageError::Schema(err) => Some(err),
            StorageError::Backend(err) => Some(err.as_ref()),
            StorageError::Unavailable(_) => None,
        }
    }
}

impl From<FieldError> for StorageError {
    fn from(err: FieldError) -> Self {
        StorageError::Schema(err)
    }
}

/// Row-level access to the storage backend for one metric type.
///
/// Implementations are shared between every persistence worker of that metric type, one per
/// downsampling level, so they take the [`Model`] on every call.
pub trait MetricsDao<M: Metrics>: Send + Sync {
    /// Load the stored rows for `ids`.
    ///
    /// Ids without a stored row are skipped; the result only holds rows that were found.
    fn multi_get(&self, model: &Model, ids: &[MetricId]) -> Result<Vec<M>, StorageError>;

    /// Prepare the insert of a row that is not known to storage yet.
    ///
    /// `callback` must be attached to the returned request so the session cache learns the
    /// outcome of the write.
    fn prepare_batch_insert(
        &self,
        model: &Model,
        metrics: &M,
        callback: SessionCacheCallback<M>,
    ) -> Result<PrepareRequest, StorageError> {
        Ok(PrepareRequest::new(
            RequestKind::Insert,
            model.clone(),
            metrics.id().clone(),
            metrics.to_storage_fields(),
        )
        .with_callback(callback))
    }

    /// Prepare the overwrite of an existing row.
    fn prepare_batch_update(
        &self,
        model: &Model,
        metrics: &M,
        callback: SessionCacheCallback<M>,
    ) -> Result<PrepareRequest, StorageError> {
        Ok(PrepareRequest::new(
            RequestKind::Update,
            model.clone(),
            metrics.id().clone(),
            metrics.to_storage_fields(),
        )
        .with_callback(callback))
    }

    /// Whether storage retention has already removed the row behind a cached record.
    ///
    /// The default compares days in UTC: the row is gone once its time bucket lies entirely
    /// before the day `ttl_days` before `now_millis`.
    fn is_expired_cache(&self, model: &Model, cached: &M, now_millis: i64, ttl_days: u32) -> bool {
        let _ = model;
        let cutoff = now_millis.saturating_sub(i64::from(ttl_days) * DAY_MILLIS);
        let cutoff_day = cutoff - cutoff.rem_euclid(DAY_MILLIS);
        cached.time_bucket().end_millis() <= cutoff_day
    }
}

/// Executes prepared requests against the backend.
pub trait BatchDao: Send + Sync {
    /// Execute `requests`.
    ///
    /// Each request must be [confirmed](PrepareRequest::confirm) once its write is executed, and
    /// [rejected](PrepareRequest::reject) (or dropped) when it is not. An `Err` reports that the
    /// flush as a whole failed; requests still held at that point are dropped, which rejects them.
    fn flush(&self, requests: Vec<PrepareRequest>) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use assert2::check;
    use rstest::rstest;
    use strata_core::{Downsampling, EntityId, TimeBucket, functions::SumMetrics};

    use super::*;

    struct NoRows;

    impl MetricsDao<SumMetrics> for NoRows {
        fn multi_get(&self, _: &Model, _: &[MetricId]) -> Result<Vec<SumMetrics>, StorageError> {
            Ok(vec![])
        }
    }

    fn cached(value: u64, level: Downsampling) -> SumMetrics {
        SumMetrics::new(
            MetricId::new(EntityId::single("svc"), TimeBucket::new(value, level).unwrap()),
            1,
        )
    }

    // 2024-01-10T12:00:00Z
    const NOW: i64 = 1_704_888_000_000;

    #[rstest]
    #[case::inside_ttl(20240103, Downsampling::Day, false)]
    #[case::day_before_cutoff(20240102, Downsampling::Day, true)]
    #[case::last_minute_before_cutoff(202401022359, Downsampling::Minute, true)]
    #[case::first_minute_of_cutoff_day(202401030000, Downsampling::Minute, false)]
    #[case::month_spanning_cutoff(202401, Downsampling::Month, false)]
    #[case::previous_month(202312, Downsampling::Month, true)]
    fn default_expiry_compares_days(
        #[case] value: u64,
        #[case] level: Downsampling,
        #[case] expired: bool,
    ) {
        let model = Model::new("sum", level).with_time_relative_id(false);
        check!(NoRows.is_expired_cache(&model, &cached(value, level), NOW, 7) == expired);
    }

    #[test]
    fn storage_error_keeps_schema_source() {
        let err = StorageError::from(FieldError::Missing("value".into()));
        check!(err.source().is_some());
        check!(err.to_string().contains("schema"));
    }
}
