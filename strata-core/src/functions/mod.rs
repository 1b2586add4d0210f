// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stock metric records.
//!
//! | record | accumulators | derived |
//! |---|---|---|
//! | [`SumMetrics`] | `value` (add) | |
//! | [`CpmMetrics`] | `total` (add) | `value`, calls per minute of the bucket |
//! | [`LongAvgMetrics`] | `summation`, `count` (add) | `value`, integer average |
//! | [`MaxLongMetrics`] | `value` (max) | |
//! | [`LatestMetrics`] | `value`, `observed_at` (latest wins) | |
//! | [`PercentileMetrics`] | `dataset` (add), `precision` (fixed) | `p50` .. `p99` |

mod avg;
mod cpm;
mod latest;
mod max;
mod percentile;
mod sum;

pub use avg::LongAvgMetrics;
pub use cpm::CpmMetrics;
pub use latest::LatestMetrics;
pub use max::MaxLongMetrics;
pub use percentile::{PercentileMetrics, RANKS};
pub use sum::SumMetrics;
