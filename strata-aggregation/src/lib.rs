// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod aggregate;
pub mod buffer;
pub mod dao;
pub mod export;
pub mod persistent;
pub mod request;
pub mod session;
pub mod trans;
pub mod window;

#[cfg(feature = "test-util")]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod test_util;

pub use aggregate::{AggregateWorker, AggregateWorkerBuilder};
pub use buffer::MergeableBuffer;
pub use dao::{BatchDao, MetricsDao, StorageError};
pub use export::{EventKind, Fanout, MetricsConsumer, QueuedConsumer};
pub use persistent::{PersistenceWorker, PersistentWorker, PersistentWorkerBuilder};
pub use request::{PrepareRequest, RequestKind, WriteCallback};
pub use session::{SessionCache, SessionCacheCallback};
pub use trans::TransWorker;
pub use window::{DrainGuard, Window};
