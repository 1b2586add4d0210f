// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod graph;
pub mod processor;
pub mod timer;

pub use config::{CarrierConfig, ConfigError, OverflowConfig, PipelineConfig, PoolConfig};
pub use graph::{Graph, GraphBuilder, GraphError, GraphRegistry, Next, NodeRef};
pub use processor::{MetricsStreamProcessor, RunningPipeline};
pub use timer::{PersistenceTimer, PersistenceTimerHandle, RoundSummary};

pub use strata_aggregation as aggregation;
pub use strata_carrier as carrier;

pub use strata_core::{
    Downsample, Downsampling, EntityId, MetricId, Metrics, Model, TimeBucket, TimeSource, Worker,
    functions,
};

/// Storage field schema of metric records.
pub mod fields {
    pub use strata_core::{FieldError, FieldValue, FromStorageFields, StorageFields, ToStorageFields};
}

/// Utilities for tests
#[cfg(feature = "test-util")]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod test_util {
    pub use strata_aggregation::test_util::{ExecutedRequest, MemoryStorage, RecordingConsumer};
    pub use strata_core::fakes::ManuallyAdvancedTimeSource;
}
