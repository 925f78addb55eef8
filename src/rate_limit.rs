//! Sliding-window rate limiter
//!
//! At most `max_requests` admissions are granted in any trailing `window`.
//! The admitted timestamps live behind an async mutex and are only touched by
//! [`RateLimiter::acquire`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::RateLimitConfig;
use crate::error::{FetchError, Result};
use crate::observability::{EventSink, FetchEvent, NoopSink};

pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    admitted: Mutex<VecDeque<Instant>>,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("window", &self.window)
            .field("max_requests", &self.max_requests)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self::with_sink(cfg, Arc::new(NoopSink))
    }

    pub fn with_sink(cfg: RateLimitConfig, sink: Arc<dyn EventSink>) -> Self {
        let max_requests = cfg.max_requests.max(1);
        Self {
            window: cfg.window,
            max_requests,
            admitted: Mutex::new(VecDeque::with_capacity(max_requests)),
            sink,
        }
    }

    /// Wait for an admission slot, or fail with `Cancelled`.
    ///
    /// After every wait the window is re-evaluated from scratch: another
    /// waiter may have taken the slot that opened up.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let wait = {
                let mut admitted = self.admitted.lock().await;
                let now = Instant::now();
                while let Some(&oldest) = admitted.front() {
                    if now.duration_since(oldest) >= self.window {
                        admitted.pop_front();
                    } else {
                        break;
                    }
                }
                if admitted.len() < self.max_requests {
                    admitted.push_back(now);
                    trace!(in_window = admitted.len(), "rate limiter admitted");
                    return Ok(());
                }
                let oldest = admitted.front().copied().unwrap_or(now);
                self.window.saturating_sub(now.duration_since(oldest))
            };

            self.sink.emit(FetchEvent::RateLimitExhausted { wait });
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = sleep(wait) => {}
            }
        }
    }
}
