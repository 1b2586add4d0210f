// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant, SystemTime},
};

use crate::time::Time;

#[derive(Debug)]
struct Frozen {
    now: SystemTime,
    instant: Instant,
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying time, so a test can keep one handle and give the other to the
/// component under test.
///
/// ```
/// use std::time::{Duration, UNIX_EPOCH};
/// use strata_core::{fakes::ManuallyAdvancedTimeSource, time::TimeSource};
///
/// let clock = ManuallyAdvancedTimeSource::at_time(UNIX_EPOCH);
/// let ts = TimeSource::custom(clock.clone());
/// clock.advance(Duration::from_millis(150));
/// assert_eq!(ts.now_millis(), 150);
/// ```
#[derive(Debug, Clone)]
pub struct ManuallyAdvancedTimeSource(Arc<Mutex<Frozen>>);

impl ManuallyAdvancedTimeSource {
    /// Start the clock at `time`.
    pub fn at_time(time: impl Into<SystemTime>) -> Self {
        Self(Arc::new(Mutex::new(Frozen {
            now: time.into(),
            instant: Instant::now(),
        })))
    }

    /// Jump the wall clock to `time` without moving the monotonic instant.
    pub fn update_time(&self, time: impl Into<SystemTime>) {
        self.0.lock().unwrap().now = time.into();
    }

    /// Move both the wall clock and the monotonic instant forward by `elapsed`.
    pub fn advance(&self, elapsed: Duration) {
        let mut frozen = self.0.lock().unwrap();
        frozen.now += elapsed;
        frozen.instant += elapsed;
    }
}

impl Time for ManuallyAdvancedTimeSource {
    fn now(&self) -> SystemTime {
        self.0.lock().unwrap().now
    }

    fn instant(&self) -> Instant {
        self.0.lock().unwrap().instant
    }
}
