// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Injectable clocks.
//!
//! Every component that looks at the wall clock (session expiry, bucket assignment, TTL checks)
//! takes a [`TimeSource`] instead of calling [`SystemTime::now`] directly, so tests can move time
//! by hand with [`crate::fakes::ManuallyAdvancedTimeSource`].

use std::{
    fmt::Debug,
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

/// A source of wall-clock and monotonic time.
pub trait Time: Send + Sync + Debug {
    /// Current wall-clock time.
    fn now(&self) -> SystemTime;

    /// Current monotonic instant.
    fn instant(&self) -> Instant;
}

/// Handle to the clock a component reads. Defaults to the system clock.
#[derive(Clone, Debug, Default)]
pub enum TimeSource {
    /// The operating system clock
    #[default]
    System,
    /// A custom clock, typically a fake in tests
    Custom(Arc<dyn Time>),
}

impl TimeSource {
    /// Wrap a custom clock.
    pub fn custom(time: impl Time + 'static) -> Self {
        TimeSource::Custom(Arc::new(time))
    }

    /// Current wall-clock time.
    pub fn system_time(&self) -> SystemTime {
        match self {
            TimeSource::System => SystemTime::now(),
            TimeSource::Custom(time) => time.now(),
        }
    }

    /// Current monotonic instant.
    pub fn instant(&self) -> Instant {
        match self {
            TimeSource::System => Instant::now(),
            TimeSource::Custom(time) => time.instant(),
        }
    }

    /// Current wall-clock time as epoch milliseconds. Times before the epoch read as 0.
    pub fn now_millis(&self) -> i64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}
