//! # worklog-fetch
//!
//! Pulls time-stamped work records from a rate-limited, paginated REST API
//! across long time spans and many subjects, with bounded resource use,
//! explicit partial results, and cooperative cancellation.
//!
//! ## Core Concepts
//!
//! - **Executor**: one logical request with rate-limit admission, per-attempt
//!   timeout, retry with full-jitter backoff, and `Retry-After` support
//! - **Paginator**: drains one subject over one range, slicing long ranges into
//!   90-day chunks and deduplicating records across pages and chunks
//! - **Budgets**: per-fetch ceilings on pages, records and time. Hitting one
//!   yields a truncated outcome, never an error
//! - **Bulk scheduler**: picks a sequential or batched-concurrent strategy by
//!   cohort size, under an operation-wide circuit breaker
//! - **Transport**: any Tower `Service<ApiRequest>`; [`HttpTransport`] is the
//!   `reqwest` implementation
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chrono::{Duration, Utc};
//! use tokio_util::sync::CancellationToken;
//! use worklog_fetch::{ClientConfig, StaticToken, TimeRange, WorklogClient};
//!
//! # async fn example() -> worklog_fetch::Result<()> {
//! let config = ClientConfig {
//!     base_url: "https://api.example.com/4".into(),
//!     ..Default::default()
//! };
//! let client = WorklogClient::connect(config, Arc::new(StaticToken::new("token")))?;
//!
//! let end = Utc::now();
//! let range = TimeRange::new(end - Duration::days(365), end)?;
//! let subjects = vec!["acct-1".to_string(), "acct-2".to_string()];
//!
//! let bulk = client
//!     .fetch_for_subjects(&subjects, range, &CancellationToken::new())
//!     .await?;
//! for (subject, outcome) in &bulk.subjects {
//!     println!(
//!         "{subject}: {} records (truncated: {}, reasons: {:?})",
//!         outcome.records().len(),
//!         outcome.truncated(),
//!         outcome.truncation_reasons(),
//!     );
//! }
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod budgets;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod observability;
pub mod outcome;
pub mod pagination;
pub mod rate_limit;
pub mod records;
pub mod retry_after;
pub mod scheduler;
pub mod time_range;
pub mod transport;

pub use budgets::FetchBudget;
pub use client::WorklogClient;
pub use config::{
    BreakerLimits, BudgetLimits, BulkTierConfig, ClientConfig, RateLimitConfig, RetryPolicy,
};
pub use error::{FetchError, Result};
pub use executor::Executor;
pub use observability::{EventSink, FailureKind, FetchEvent, NoopSink, RecordingSink, TracingSink};
pub use outcome::{BulkOutcome, FetchOutcome, TruncationReason};
pub use pagination::{PageQuery, Paginator};
pub use rate_limit::RateLimiter;
pub use records::{WorkRecord, WorklogPage};
pub use scheduler::{BatchPlan, BulkScheduler, CircuitBreaker, Tier};
pub use time_range::{split, TimeRange, MAX_CHUNK_DAYS};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, NoToken, StaticToken, TokenSource};

// Re-export Tower and cancellation types that users need
pub use tokio_util::sync::CancellationToken;
pub use tower::{BoxError, Service, ServiceExt};
