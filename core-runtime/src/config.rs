//! # Controller Configuration Module
//!
//! Provides configuration management for reconciliation controllers.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a
//! `ControllerConfig` holding every tunable of a controller: worker pool size,
//! retry budget, queue rate limiting, reflector backoff and the cache-sync
//! budget. Validation is fail-fast; an invalid combination is rejected by
//! [`ControllerConfigBuilder::build`] rather than discovered at runtime.
//!
//! Durations are stored in milliseconds so a config can be loaded from JSON
//! with [`ControllerConfig::from_json`].
//!
//! ## Usage
//!
//! ```
//! use core_runtime::config::ControllerConfig;
//!
//! let config = ControllerConfig::builder()
//!     .name("pod-controller")
//!     .workers(4)
//!     .max_retries(5)
//!     .build()
//!     .expect("valid config");
//!
//! assert_eq!(config.workers, 4);
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::ControllerConfig;
//!
//! // Zero workers would never drain the queue
//! let config = ControllerConfig::builder()
//!     .workers(0)
//!     .build()
//!     .expect("Should fail - no workers");
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on the worker pool size
pub const MAX_WORKERS: usize = 1024;

/// Per-item and overall rate limiting of queue retries.
///
/// The effective delay for a failing key is the larger of the per-item
/// exponential backoff and the delay imposed by the shared token bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Delay after the first failure of a key
    pub base_delay_ms: u64,
    /// Cap on the per-item exponential delay
    pub max_delay_ms: u64,
    /// Sustained retry rate across all keys
    pub qps: f64,
    /// Token bucket size
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5,
            max_delay_ms: 1_000_000,
            qps: 10.0,
            burst: 100,
        }
    }
}

impl RateLimiterConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.base_delay_ms == 0 {
            return Err(Error::Config(
                "Rate limiter base delay must be greater than 0ms".to_string(),
            ));
        }

        if self.base_delay_ms > self.max_delay_ms {
            return Err(Error::Config(format!(
                "Rate limiter base delay ({}ms) exceeds max delay ({}ms)",
                self.base_delay_ms, self.max_delay_ms
            )));
        }

        if !self.qps.is_finite() || self.qps <= 0.0 {
            return Err(Error::Config(
                "Rate limiter qps must be a positive number".to_string(),
            ));
        }

        if self.burst == 0 {
            return Err(Error::Config(
                "Rate limiter burst must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Exponential backoff applied by the reflector between failed list/watch
/// attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First retry delay
    pub initial_ms: u64,
    /// Delay cap
    pub max_ms: u64,
    /// Multiplier applied after every consecutive failure
    pub factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 800,
            max_ms: 30_000,
            factor: 2.0,
        }
    }
}

impl BackoffConfig {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.initial_ms == 0 {
            return Err(Error::Config(
                "Reflector backoff must start above 0ms".to_string(),
            ));
        }

        if self.initial_ms > self.max_ms {
            return Err(Error::Config(format!(
                "Reflector initial backoff ({}ms) exceeds max backoff ({}ms)",
                self.initial_ms, self.max_ms
            )));
        }

        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(Error::Config(
                "Reflector backoff factor must be at least 1.0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration of one reconciliation controller.
///
/// Use [`ControllerConfigBuilder`] (via [`ControllerConfig::builder`]) to
/// construct validated instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Name used in logs and events
    pub name: String,

    /// Number of concurrent workers draining the queue
    pub workers: usize,

    /// Total handler deliveries per key before it is dropped
    pub max_retries: u32,

    /// Queue retry rate limiting
    pub rate_limiter: RateLimiterConfig,

    /// Reflector list/watch retry backoff
    pub reflector_backoff: BackoffConfig,

    /// How long a single cache-sync wait lasts before it is logged and retried
    pub cache_sync_timeout_ms: u64,

    /// Period at which every cached key is re-enqueued, disabled when `None`
    pub resync_period_ms: Option<u64>,

    /// Buffer size of the controller event bus
    pub event_buffer_size: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "controller".to_string(),
            workers: 1,
            max_retries: 5,
            rate_limiter: RateLimiterConfig::default(),
            reflector_backoff: BackoffConfig::default(),
            cache_sync_timeout_ms: 30_000,
            resync_period_ms: None,
            event_buffer_size: 100,
        }
    }
}

impl ControllerConfig {
    /// Creates a new builder for constructing a `ControllerConfig`.
    pub fn builder() -> ControllerConfigBuilder {
        ControllerConfigBuilder::default()
    }

    /// Parses and validates a JSON document. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ControllerConfig = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Invalid controller config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_sync_timeout_ms)
    }

    pub fn resync_period(&self) -> Option<Duration> {
        self.resync_period_ms.map(Duration::from_millis)
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Name is not empty
    /// - Worker count is within `1..=MAX_WORKERS`
    /// - At least one handler delivery per key
    /// - Rate limiter and reflector backoff settings
    /// - Cache-sync budget and resync period are non-zero
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("Controller name cannot be empty".to_string()));
        }

        if self.workers == 0 {
            return Err(Error::Config(
                "Worker count must be greater than 0".to_string(),
            ));
        }

        if self.workers > MAX_WORKERS {
            return Err(Error::Config(format!(
                "Worker count exceeds maximum of {}",
                MAX_WORKERS
            )));
        }

        if self.max_retries == 0 {
            return Err(Error::Config(
                "max_retries must allow at least one delivery".to_string(),
            ));
        }

        self.rate_limiter.validate()?;
        self.reflector_backoff.validate()?;

        if self.cache_sync_timeout_ms == 0 {
            return Err(Error::Config(
                "Cache sync timeout must be greater than 0ms".to_string(),
            ));
        }

        if self.resync_period_ms == Some(0) {
            return Err(Error::Config(
                "Resync period must be greater than 0ms. Omit it to disable resync."
                    .to_string(),
            ));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for constructing [`ControllerConfig`] instances.
#[derive(Debug, Default)]
pub struct ControllerConfigBuilder {
    name: Option<String>,
    workers: Option<usize>,
    max_retries: Option<u32>,
    rate_limiter: Option<RateLimiterConfig>,
    reflector_backoff: Option<BackoffConfig>,
    cache_sync_timeout: Option<Duration>,
    resync_period: Option<Duration>,
    event_buffer_size: Option<usize>,
}

impl ControllerConfigBuilder {
    /// Sets the controller name used in logs and events.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the number of workers.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::ControllerConfig;
    ///
    /// let config = ControllerConfig::builder().workers(8).build().unwrap();
    /// assert_eq!(config.workers, 8);
    /// ```
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Sets the number of handler deliveries a failing key gets before it is
    /// dropped and reported.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn rate_limiter(mut self, rate_limiter: RateLimiterConfig) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Shortcut for the per-item exponential backoff bounds.
    pub fn item_backoff(mut self, base: Duration, max: Duration) -> Self {
        let mut limiter = self.rate_limiter.take().unwrap_or_default();
        limiter.base_delay_ms = base.as_millis() as u64;
        limiter.max_delay_ms = max.as_millis() as u64;
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn reflector_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.reflector_backoff = Some(backoff);
        self
    }

    /// Sets the budget of one cache-sync wait. Exceeding it is logged and
    /// the wait is retried; it never aborts the controller.
    pub fn cache_sync_timeout(mut self, timeout: Duration) -> Self {
        self.cache_sync_timeout = Some(timeout);
        self
    }

    /// Enables periodic resync of every cached key.
    pub fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = Some(period);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Builds the final `ControllerConfig` instance.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` with an actionable message if any value is
    /// out of range.
    pub fn build(self) -> Result<ControllerConfig> {
        let defaults = ControllerConfig::default();

        let config = ControllerConfig {
            name: self.name.unwrap_or(defaults.name),
            workers: self.workers.unwrap_or(defaults.workers),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            rate_limiter: self.rate_limiter.unwrap_or(defaults.rate_limiter),
            reflector_backoff: self.reflector_backoff.unwrap_or(defaults.reflector_backoff),
            cache_sync_timeout_ms: self
                .cache_sync_timeout
                .map(|d| d.as_millis() as u64)
                .unwrap_or(defaults.cache_sync_timeout_ms),
            resync_period_ms: self
                .resync_period
                .map(|d| d.as_millis() as u64)
                .or(defaults.resync_period_ms),
            event_buffer_size: self
                .event_buffer_size
                .unwrap_or(defaults.event_buffer_size),
        };

        config.validate()?;

        Ok(config)
    }
}
