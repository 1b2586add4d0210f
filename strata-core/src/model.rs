// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-metric storage model settings.

use std::{fmt, sync::Arc};

use crate::time_bucket::Downsampling;

/// Storage-facing description of one metric at one downsampling level.
///
/// Cloning is cheap.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Model {
    name: Arc<str>,
    downsampling: Downsampling,
    time_relative_id: bool,
    support_update: bool,
}

impl Model {
    /// A model for metric `name` at `downsampling`, with update support and time-relative ids.
    pub fn new(name: impl Into<Arc<str>>, downsampling: Downsampling) -> Self {
        Self {
            name: name.into(),
            downsampling,
            time_relative_id: true,
            support_update: true,
        }
    }

    /// Whether stored rows may be updated after their first insert.
    ///
    /// When `false`, the first persisted aggregate of an identity is final and later partials
    /// for that identity are dropped.
    pub fn with_support_update(mut self, support_update: bool) -> Self {
        self.support_update = support_update;
        self
    }

    /// Whether row ids embed the time bucket.
    ///
    /// Rows whose id is not time relative can outlive the storage retention window while still
    /// sitting in the session cache, so cached copies of them are checked against the storage
    /// TTL before being trusted.
    pub fn with_time_relative_id(mut self, time_relative_id: bool) -> Self {
        self.time_relative_id = time_relative_id;
        self
    }

    /// The same metric at another downsampling level.
    pub fn at(&self, downsampling: Downsampling) -> Self {
        Self {
            downsampling,
            ..self.clone()
        }
    }

    /// Metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Downsampling level.
    pub fn downsampling(&self) -> Downsampling {
        self.downsampling
    }

    /// See [`Self::with_support_update`].
    pub fn support_update(&self) -> bool {
        self.support_update
    }

    /// See [`Self::with_time_relative_id`].
    pub fn time_relative_id(&self) -> bool {
        self.time_relative_id
    }

    /// Table or index name for this level: `{name}_{level}`.
    pub fn storage_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.name, self.downsampling)
    }
}
