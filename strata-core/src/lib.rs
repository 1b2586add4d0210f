// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod accumulate;
pub mod fields;
pub mod functions;
pub mod identity;
pub mod metrics;
pub mod model;
pub mod time;
pub mod time_bucket;
pub mod worker;

/// Fake clocks for tests.
///
/// To enable this module, you must enable the `test-util` feature.
#[cfg(feature = "test-util")]
pub mod fakes;

pub use fields::{FieldError, FieldValue, FromStorageFields, StorageFields, ToStorageFields};
pub use identity::{EntityId, MetricId};
pub use metrics::{Downsample, Metrics};
pub use model::Model;
pub use time::{Time, TimeSource};
pub use time_bucket::{Downsampling, TimeBucket, TimeBucketError};
pub use worker::Worker;
