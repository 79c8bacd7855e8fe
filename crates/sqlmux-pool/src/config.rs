//! Pool and factory configuration.

use std::time::Duration;

use sqlmux_session::MuxSettings;

use crate::error::PoolError;

/// Configuration for one connection pool.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Soft lower bound of idle connections kept through pruning.
    pub min_size: u32,

    /// Hard upper bound on live connections (idle, checked out and
    /// in-flight creations combined).
    pub max_size: u32,

    /// Time an acquisition may wait for a connection to free up.
    pub acquire_timeout: Duration,

    /// Whether connections are pooled at all. When disabled, every
    /// acquisition opens a fresh connection (subject to the non-pooled
    /// creation throttle when requested asynchronously).
    pub pooling_enabled: bool,

    /// Whether physical connections host a session multiplexer.
    pub multiplexing_enabled: bool,

    /// Multiplexing parameters applied when `multiplexing_enabled`.
    pub mux_settings: MuxSettings,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            pooling_enabled: true,
            multiplexing_enabled: false,
            mux_settings: MuxSettings::new(),
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the soft minimum number of idle connections.
    #[must_use]
    pub fn min_size(mut self, count: u32) -> Self {
        self.min_size = count;
        self
    }

    /// Set the maximum number of live connections.
    #[must_use]
    pub fn max_size(mut self, count: u32) -> Self {
        self.max_size = count;
        self
    }

    /// Set the connection acquisition timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Enable or disable pooling.
    #[must_use]
    pub fn pooling_enabled(mut self, enabled: bool) -> Self {
        self.pooling_enabled = enabled;
        self
    }

    /// Enable or disable session multiplexing on physical connections.
    #[must_use]
    pub fn multiplexing_enabled(mut self, enabled: bool) -> Self {
        self.multiplexing_enabled = enabled;
        self
    }

    /// Set the multiplexing parameters.
    #[must_use]
    pub fn mux_settings(mut self, settings: MuxSettings) -> Self {
        self.mux_settings = settings;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_size == 0 {
            return Err(PoolError::Configuration(
                "max_size must be greater than 0".into(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::Configuration(
                "min_size cannot be greater than max_size".into(),
            ));
        }
        if self.acquire_timeout.is_zero() {
            return Err(PoolError::Configuration(
                "acquire_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the connection factory itself.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct FactoryOptions {
    /// Delay before the first pruning sweep.
    pub pruning_due_time: Duration,

    /// Interval between pruning sweeps after the first.
    pub pruning_period: Duration,

    /// Number of slots in the non-pooled creation throttle.
    pub throttle_slots: usize,
}

impl Default for FactoryOptions {
    fn default() -> Self {
        Self {
            pruning_due_time: Duration::from_secs(4 * 60),
            pruning_period: Duration::from_secs(30),
            throttle_slots: std::thread::available_parallelism().map_or(1, usize::from),
        }
    }
}

impl FactoryOptions {
    /// Create factory options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay before the first pruning sweep.
    #[must_use]
    pub fn pruning_due_time(mut self, due: Duration) -> Self {
        self.pruning_due_time = due;
        self
    }

    /// Set the interval between pruning sweeps.
    #[must_use]
    pub fn pruning_period(mut self, period: Duration) -> Self {
        self.pruning_period = period;
        self
    }

    /// Set the number of non-pooled creation throttle slots.
    #[must_use]
    pub fn throttle_slots(mut self, slots: usize) -> Self {
        self.throttle_slots = slots.max(1);
        self
    }
}
