//! Configuration of the primitives.
//!
//! Every struct has a `Default` matching the values the ingestion pipeline runs with and a
//! `validate()` that rejects settings that would block forever. With the `serde` feature enabled
//! the structs can be deserialized; missing fields fall back to defaults.

#[cfg(feature = "serde")]
use serde::Deserialize;
use std::time::Duration;

/// Settings that would make a primitive block forever or spin.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Channel with no room for even one item.
    #[error("channel capacity must be greater than zero")]
    ZeroCapacity,

    /// Error sideband that can not hold a single error.
    #[error("channel error capacity must be greater than zero")]
    ZeroErrorCapacity,

    /// Buffer that would flush on every `add`.
    #[error("buffer limit must be greater than zero")]
    ZeroLimit,

    /// Periodic flush with no delay between rounds.
    #[error("buffer flush interval must be greater than zero")]
    ZeroInterval,

    /// Rate limiter that never admits anything.
    #[error("rate limiter threshold must be greater than zero")]
    ZeroThreshold,

    /// Rate limiter window of no length.
    #[error("rate limiter period must be greater than zero")]
    ZeroPeriod,
}

/// Configuration of [`Channel`](crate::channel::Channel).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Deserialize), serde(default))]
pub struct ChannelConfig {
    /// Maximum number of buffered items before `push` blocks.
    pub capacity: usize,

    /// Maximum number of unread errors kept in the error sideband.
    /// The oldest error is discarded when this is exceeded.
    pub error_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            capacity: 1000,
            error_capacity: 1024,
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.error_capacity == 0 {
            return Err(ConfigError::ZeroErrorCapacity);
        }
        Ok(())
    }
}

/// Configuration of [`AutoFlushBuffer`](crate::flush_buffer::AutoFlushBuffer).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Deserialize), serde(default))]
pub struct BufferConfig {
    /// Number of pending items that triggers a flush from `add`.
    pub limit: usize,

    /// Time between periodic flushes.
    pub interval: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            limit: 100,
            interval: Duration::from_secs(5),
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit == 0 {
            return Err(ConfigError::ZeroLimit);
        }
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }
}

/// Configuration of [`TokenBucket`](crate::rate_limit::TokenBucket).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Deserialize), serde(default))]
pub struct RateLimiterConfig {
    /// Permits per window.
    pub threshold: u64,

    /// Window length.
    pub period: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        RateLimiterConfig {
            threshold: 4,
            period: Duration::from_secs(3),
        }
    }
}

impl RateLimiterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold == 0 {
            return Err(ConfigError::ZeroThreshold);
        }
        if self.period.is_zero() {
            return Err(ConfigError::ZeroPeriod);
        }
        Ok(())
    }
}

/// Configuration of [`BufferedWriter`](crate::writer::BufferedWriter).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Deserialize), serde(default))]
pub struct WriterConfig {
    pub channel: ChannelConfig,
    pub buffer: BufferConfig,
}

impl WriterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.channel.validate()?;
        self.buffer.validate()
    }
}
