// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Time buckets and the downsampling levels they are expressed in.
//!
//! A [`TimeBucket`] renders as the familiar packed decimal form: `yyyyMMddHHmm` at minute level,
//! `yyyyMMddHH` at hour level, `yyyyMMdd` at day level and `yyyyMM` at month level. All buckets are
//! aligned in UTC.

use std::{error::Error, fmt, time::SystemTime};

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Granularity of a [`TimeBucket`], ordered from finest to coarsest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Downsampling {
    /// One bucket per minute
    Minute,
    /// One bucket per hour
    Hour,
    /// One bucket per day
    Day,
    /// One bucket per calendar month
    Month,
}

impl Downsampling {
    /// All levels, finest first.
    pub const ALL: [Downsampling; 4] = [
        Downsampling::Minute,
        Downsampling::Hour,
        Downsampling::Day,
        Downsampling::Month,
    ];

    /// Lower-case name of the level, used in storage names and log fields.
    pub fn name(self) -> &'static str {
        match self {
            Downsampling::Minute => "minute",
            Downsampling::Hour => "hour",
            Downsampling::Day => "day",
            Downsampling::Month => "month",
        }
    }

    /// Levels strictly coarser than `self`, finest first.
    pub fn coarser(self) -> impl Iterator<Item = Downsampling> {
        Self::ALL.into_iter().filter(move |level| *level > self)
    }
}

impl fmt::Display for Downsampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when a [`TimeBucket`] can't be constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeBucketError {
    /// The packed decimal value isn't a valid date at the given level
    Malformed {
        /// The rejected value
        value: u64,
        /// The level it was parsed at
        level: Downsampling,
    },
    /// The timestamp is outside of the representable calendar range
    OutOfRange(i64),
}

impl fmt::Display for TimeBucketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeBucketError::Malformed { value, level } => {
                write!(f, "{value} is not a valid {level} time bucket")
            }
            TimeBucketError::OutOfRange(millis) => {
                write!(f, "timestamp {millis}ms is out of range")
            }
        }
    }
}

impl Error for TimeBucketError {}

/// A UTC-aligned time window at a given [`Downsampling`] level.
///
/// Two buckets are equal only if they start at the same instant *and* have the same level, so the
/// day bucket `20240101` and the month bucket `202401` never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeBucket {
    start: NaiveDateTime,
    level: Downsampling,
}

impl TimeBucket {
    /// Parse a packed decimal bucket such as `202401011230` (minute) or `20240101` (day).
    pub fn new(value: u64, level: Downsampling) -> Result<Self, TimeBucketError> {
        let malformed = || TimeBucketError::Malformed { value, level };
        let (date, hour, minute) = match level {
            Downsampling::Minute => (value / 10_000, (value / 100) % 100, value % 100),
            Downsampling::Hour => (value / 100, value % 100, 0),
            Downsampling::Day => (value, 0, 0),
            Downsampling::Month => (value.checked_mul(100).ok_or_else(malformed)? + 1, 0, 0),
        };
        let (year, month, day) = (date / 10_000, (date / 100) % 100, date % 100);
        let start = i32::try_from(year)
            .ok()
            .and_then(|year| NaiveDate::from_ymd_opt(year, month as u32, day as u32))
            .and_then(|date| date.and_hms_opt(hour as u32, minute as u32, 0))
            .ok_or_else(malformed)?;
        Ok(Self { start, level })
    }

    /// The bucket at `level` containing the epoch timestamp `millis`.
    pub fn from_millis(millis: i64, level: Downsampling) -> Result<Self, TimeBucketError> {
        let at = DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or(TimeBucketError::OutOfRange(millis))?
            .naive_utc();
        Ok(Self {
            start: truncate(at, level),
            level,
        })
    }

    /// The bucket at `level` containing `time`.
    pub fn from_system_time(time: SystemTime, level: Downsampling) -> Result<Self, TimeBucketError> {
        let at: DateTime<Utc> = time.into();
        Ok(Self {
            start: truncate(at.naive_utc(), level),
            level,
        })
    }

    /// The packed decimal form of this bucket.
    pub fn value(&self) -> u64 {
        let d = self.start;
        let year_month = u64::try_from(d.year()).unwrap_or(0) * 100 + u64::from(d.month());
        let day = year_month * 100 + u64::from(d.day());
        match self.level {
            Downsampling::Month => year_month,
            Downsampling::Day => day,
            Downsampling::Hour => day * 100 + u64::from(d.hour()),
            Downsampling::Minute => (day * 100 + u64::from(d.hour())) * 100 + u64::from(d.minute()),
        }
    }

    /// The level of this bucket.
    pub fn level(&self) -> Downsampling {
        self.level
    }

    /// Epoch millis of the first instant inside the bucket.
    pub fn start_millis(&self) -> i64 {
        self.start.and_utc().timestamp_millis()
    }

    /// Epoch millis of the first instant after the bucket.
    pub fn end_millis(&self) -> i64 {
        self.end().and_utc().timestamp_millis()
    }

    /// Length of the bucket in minutes. Month buckets follow the calendar.
    pub fn span_minutes(&self) -> i64 {
        (self.end() - self.start).num_minutes()
    }

    /// The bucket containing this one at a coarser (or equal) level.
    ///
    /// Returns `None` when `level` is finer than this bucket's level.
    pub fn downsample(&self, level: Downsampling) -> Option<Self> {
        (level >= self.level).then(|| Self {
            start: truncate(self.start, level),
            level,
        })
    }

    fn end(&self) -> NaiveDateTime {
        match self.level {
            Downsampling::Minute => self.start + TimeDelta::minutes(1),
            Downsampling::Hour => self.start + TimeDelta::hours(1),
            Downsampling::Day => self.start + Days::new(1),
            Downsampling::Month => self.start + Months::new(1),
        }
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

fn truncate(at: NaiveDateTime, level: Downsampling) -> NaiveDateTime {
    let midnight = at.date().and_time(NaiveTime::MIN);
    match level {
        Downsampling::Minute => {
            midnight + TimeDelta::minutes(i64::from(at.hour() * 60 + at.minute()))
        }
        Downsampling::Hour => midnight + TimeDelta::hours(i64::from(at.hour())),
        Downsampling::Day => midnight,
        Downsampling::Month => midnight - Days::new(u64::from(at.day0())),
    }
}
