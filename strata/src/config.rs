// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pipeline configuration.

use std::{error::Error, fmt, thread, time::Duration};

use serde::Deserialize;
use strata_carrier::{CarrierBuilder, ConsumerPoolBuilder, OverflowPolicy};

/// An invalid pipeline configuration.
#[derive(Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// The TOML document could not be parsed
    Parse(toml::de::Error),
    /// A setting holds a value the pipeline cannot run with
    Invalid {
        /// Setting name
        key: &'static str,
        /// What is wrong with it
        reason: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse(err) => write!(f, "invalid pipeline configuration: {err}"),
            ConfigError::Invalid { key, reason } => write!(f, "invalid `{key}`: {reason}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Parse(err) => Some(err),
            ConfigError::Invalid { .. } => None,
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err)
    }
}

/// Overflow policy names accepted in configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowConfig {
    /// [`OverflowPolicy::Block`] for `block_timeout_ms`
    #[default]
    Block,
    /// [`OverflowPolicy::DropOldest`]
    DropOldest,
    /// [`OverflowPolicy::RunOnCaller`]
    RunOnCaller,
}

/// Ingestion queue settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CarrierConfig {
    /// Capacity of each channel
    pub channel_size: usize,
    /// Number of channels
    pub channels: usize,
    /// What producers do when a channel is full
    pub overflow: OverflowConfig,
    /// How long a producer blocks under [`OverflowConfig::Block`]
    pub block_timeout_ms: u64,
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            channel_size: 2000,
            channels: 1,
            overflow: OverflowConfig::Block,
            block_timeout_ms: 1000,
        }
    }
}

impl CarrierConfig {
    /// The configured overflow policy.
    pub fn overflow_policy(&self) -> OverflowPolicy {
        match self.overflow {
            OverflowConfig::Block => OverflowPolicy::Block {
                timeout: Duration::from_millis(self.block_timeout_ms),
            },
            OverflowConfig::DropOldest => OverflowPolicy::DropOldest,
            OverflowConfig::RunOnCaller => OverflowPolicy::RunOnCaller,
        }
    }

    /// A carrier builder named `name` with these settings.
    pub fn builder<T: Send + 'static>(&self, name: impl Into<String>) -> CarrierBuilder<T> {
        CarrierBuilder::new()
            .name(name)
            .channels(self.channels)
            .channel_size(self.channel_size)
            .overflow(self.overflow_policy())
    }
}

/// Consumer pool settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Consumer threads
    pub threads: usize,
    /// Maximum items per consumed batch
    pub batch_size: usize,
    /// Idle park time of a consumer thread
    pub consume_cycle_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = thread::available_parallelism().map_or(1, usize::from);
        Self {
            threads: (cores / 8).max(1),
            batch_size: 1000,
            consume_cycle_ms: 20,
        }
    }
}

impl PoolConfig {
    /// A pool builder named `name` with these settings.
    pub fn builder(&self, name: impl Into<String>) -> ConsumerPoolBuilder {
        ConsumerPoolBuilder::new()
            .name(name)
            .threads(self.threads)
            .batch_size(self.batch_size)
            .consume_cycle(Duration::from_millis(self.consume_cycle_ms))
    }
}

/// Settings of a [`MetricsStreamProcessor`](crate::MetricsStreamProcessor).
///
/// Every key is optional:
///
/// ```
/// use std::time::Duration;
/// use strata::PipelineConfig;
///
/// let config = PipelineConfig::from_toml_str(r#"
///     persistent_period_ms = 10000
///
///     [carrier]
///     overflow = "drop_oldest"
/// "#).unwrap();
/// assert_eq!(config.persistent_period(), Duration::from_secs(10));
/// assert_eq!(config.max_batch_get_size, 2000);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Interval between persistence rounds
    pub persistent_period_ms: u64,
    /// Session timeout of the base level workers
    pub storage_session_timeout_ms: u64,
    /// Storage retention, used to detect cached rows storage already deleted
    pub metrics_data_ttl_days: u32,
    /// Maximum identities per storage load
    pub max_batch_get_size: usize,
    /// Downsampling workers drain every this many rounds
    pub downsampling_persistent_mod: u64,
    /// Downsampling workers keep sessions this many times longer
    pub downsampling_session_factor: u32,
    /// Added per downsampling worker to its session timeout, so they do not all evict at once
    pub session_offset_step_ms: u64,
    /// Flush period of the first level aggregation
    pub l1_flush_period_ms: u64,
    /// Threads preparing requests concurrently within a round
    pub prepare_threads: usize,
    /// First level aggregation queues
    pub carrier: CarrierConfig,
    /// Consumer pool draining the queues
    pub pool: PoolConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            persistent_period_ms: 25_000,
            storage_session_timeout_ms: 70_000,
            metrics_data_ttl_days: 7,
            max_batch_get_size: 2000,
            downsampling_persistent_mod: 4,
            downsampling_session_factor: 4,
            session_offset_step_ms: 200,
            l1_flush_period_ms: 500,
            prepare_threads: 2,
            carrier: CarrierConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every setting is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("persistent_period_ms", self.persistent_period_ms as usize),
            ("max_batch_get_size", self.max_batch_get_size),
            ("downsampling_persistent_mod", self.downsampling_persistent_mod as usize),
            ("downsampling_session_factor", self.downsampling_session_factor as usize),
            ("prepare_threads", self.prepare_threads),
            ("carrier.channel_size", self.carrier.channel_size),
            ("carrier.channels", self.carrier.channels),
            ("pool.threads", self.pool.threads),
            ("pool.batch_size", self.pool.batch_size),
        ];
        match positive.into_iter().find(|(_, value)| *value == 0) {
            Some((key, _)) => Err(ConfigError::Invalid {
                key,
                reason: "must be positive",
            }),
            None => Ok(()),
        }
    }

    /// Interval between persistence rounds.
    pub fn persistent_period(&self) -> Duration {
        Duration::from_millis(self.persistent_period_ms)
    }

    /// Session timeout of the base level workers.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_session_timeout_ms)
    }

    /// Session timeout of the `index`th downsampling worker.
    pub fn downsampling_session_timeout(&self, index: u32) -> Duration {
        self.session_timeout() * self.downsampling_session_factor
            + Duration::from_millis(self.session_offset_step_ms) * index
    }

    /// Flush period of the first level aggregation.
    pub fn l1_flush_period(&self) -> Duration {
        Duration::from_millis(self.l1_flush_period_ms)
    }
}
