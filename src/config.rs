//! Configuration for the worklog client
//!
//! All values are static for the lifetime of a client. Loading them from
//! files or the environment is left to the embedding service; everything here
//! deserializes with serde and carries defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{FetchError, Result};

/// Serialize a `Duration` as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Top-level client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the worklog API, e.g. `https://api.example.com/4`
    pub base_url: String,

    /// Path of the worklog listing endpoint, relative to `base_url`
    pub worklogs_path: String,

    /// Query parameter used to filter by subject server-side
    pub subject_filter_key: String,

    /// Records requested per page
    pub page_size: usize,

    /// Deadline for a single attempt
    #[serde(with = "duration_ms", rename = "request_timeout_ms")]
    pub request_timeout: Duration,

    pub retry: RetryPolicy,

    pub rate_limit: RateLimitConfig,

    pub tiers: BulkTierConfig,

    /// Ceilings for one subject's fetch
    pub budget: BudgetLimits,

    /// Ceilings for a whole bulk call
    pub breaker: BreakerLimits,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            worklogs_path: "worklogs".to_string(),
            subject_filter_key: "authorAccountId".to_string(),
            page_size: 50,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            tiers: BulkTierConfig::default(),
            budget: BudgetLimits::default(),
            breaker: BreakerLimits::default(),
        }
    }
}

impl ClientConfig {
    /// Reject values that would stall or misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(FetchError::Config("page_size must be positive".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(FetchError::Config("request_timeout must be positive".into()));
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.window.is_zero() {
            return Err(FetchError::Config(
                "rate limit needs a positive window and max_requests".into(),
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(FetchError::Config(
                "retry base_delay exceeds max_delay".into(),
            ));
        }
        self.tiers.validate()
    }
}

/// Retry behaviour for a single logical request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,

    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,

    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,

    /// Statuses considered transient
    pub retryable_status_codes: BTreeSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            retryable_status_codes: [429, 500, 502, 503, 504].into_iter().collect(),
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }
}

/// Sliding-window rate limiting
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    #[serde(with = "duration_ms", rename = "window_ms")]
    pub window: Duration,

    /// Admissions allowed within one window
    pub max_requests: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 100,
        }
    }
}

/// Bulk strategy thresholds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkTierConfig {
    pub small_threshold: usize,
    pub medium_threshold: usize,
    pub medium_batch_size: usize,
    pub medium_concurrency: usize,
    pub large_batch_size: usize,
    pub large_concurrency: usize,
}

impl Default for BulkTierConfig {
    fn default() -> Self {
        Self {
            small_threshold: 5,
            medium_threshold: 50,
            medium_batch_size: 10,
            medium_concurrency: 3,
            large_batch_size: 25,
            large_concurrency: 5,
        }
    }
}

impl BulkTierConfig {
    pub fn validate(&self) -> Result<()> {
        if self.small_threshold > self.medium_threshold {
            return Err(FetchError::Config(
                "small_threshold exceeds medium_threshold".into(),
            ));
        }
        let sizes = [
            self.medium_batch_size,
            self.medium_concurrency,
            self.large_batch_size,
            self.large_concurrency,
        ];
        if sizes.contains(&0) {
            return Err(FetchError::Config(
                "tier batch sizes and concurrency must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Ceilings for one top-level fetch (one subject, one range)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    pub max_records: usize,
    pub max_pages: usize,
    #[serde(with = "duration_ms", rename = "max_duration_ms")]
    pub max_duration: Duration,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            max_records: 10_000,
            max_pages: 200,
            max_duration: Duration::from_secs(120),
        }
    }
}

/// Operation-wide circuit breaker ceilings for a bulk call
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerLimits {
    pub max_total_records: usize,
    pub max_total_pages: usize,
    #[serde(with = "duration_ms", rename = "max_duration_ms")]
    pub max_duration: Duration,
}

impl Default for BreakerLimits {
    fn default() -> Self {
        Self {
            max_total_records: 100_000,
            max_total_pages: 2_000,
            max_duration: Duration::from_secs(600),
        }
    }
}
