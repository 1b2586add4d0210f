// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod carrier;
pub mod consumer;
pub mod partition;
pub mod pool;
#[doc(hidden)]
pub mod rate_limit;

pub use carrier::{Carrier, CarrierBuilder, CarrierStats, OverflowPolicy, ProduceError};
pub use consumer::{ConsumeError, Consumer};
pub use partition::{KeyPartitioner, Partitioner, RollingPartitioner};
pub use pool::{ConsumerPool, ConsumerPoolBuilder, ConsumerPoolHandle};
