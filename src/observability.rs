//! Observability: fetch events and sinks
//!
//! The fetch path reports what happened through an injected [`EventSink`].
//! Emission is fire-and-forget: a sink must not block and cannot fail the
//! caller.
//!
//! - `TracingSink` turns events into structured `tracing` records
//! - `RecordingSink` keeps them in memory, mostly for tests
//! - `NoopSink` drops everything

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

/// Why an attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Status,
    Timeout,
    Transport,
    Cancelled,
    Decode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    RequestSucceeded {
        attempt: usize,
        status: u16,
        duration: Duration,
    },
    RequestFailed {
        attempt: usize,
        status: Option<u16>,
        kind: FailureKind,
        duration: Duration,
    },
    RetryScheduled {
        attempt: usize,
        delay: Duration,
        kind: FailureKind,
        from_retry_after: bool,
    },
    RateLimitExhausted {
        wait: Duration,
    },
    CircuitBreakerTripped {
        subjects_completed: usize,
        total_records: usize,
        total_pages: usize,
    },
}

impl FetchEvent {
    pub fn name(&self) -> &'static str {
        match self {
            FetchEvent::RequestSucceeded { .. } => "request_succeeded",
            FetchEvent::RequestFailed { .. } => "request_failed",
            FetchEvent::RetryScheduled { .. } => "retry_scheduled",
            FetchEvent::RateLimitExhausted { .. } => "rate_limit_exhausted",
            FetchEvent::CircuitBreakerTripped { .. } => "circuit_breaker_tripped",
        }
    }
}

/// Receiver for fetch events.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: FetchEvent);
}

impl<F> EventSink for F
where
    F: Fn(FetchEvent) + Send + Sync + 'static,
{
    fn emit(&self, event: FetchEvent) {
        self(event)
    }
}

/// Sink that logs through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: FetchEvent) {
        match event {
            FetchEvent::RequestSucceeded { attempt, status, duration } => {
                debug!(attempt, status, duration_ms = duration.as_millis() as u64, "request succeeded")
            }
            FetchEvent::RequestFailed { attempt, status, kind, duration } => warn!(
                attempt,
                status = ?status,
                kind = ?kind,
                duration_ms = duration.as_millis() as u64,
                "request failed"
            ),
            FetchEvent::RetryScheduled { attempt, delay, kind, from_retry_after } => info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                kind = ?kind,
                from_retry_after,
                "retry scheduled"
            ),
            FetchEvent::RateLimitExhausted { wait } => {
                debug!(wait_ms = wait.as_millis() as u64, "rate limit exhausted, waiting")
            }
            FetchEvent::CircuitBreakerTripped { subjects_completed, total_records, total_pages } => warn!(
                subjects_completed,
                total_records,
                total_pages,
                "circuit breaker tripped"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: FetchEvent) {}
}

/// Sink that stores every event in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<FetchEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FetchEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: FetchEvent) {
        // A poisoned lock only loses the event.
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
