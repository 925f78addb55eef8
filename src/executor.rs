//! Resilient request execution
//!
//! One logical call = one rate-limiter admission followed by up to
//! `max_retries + 1` attempts. Each attempt runs under the per-attempt
//! timeout raced against the caller's cancellation token; the two are kept
//! apart so a fired token is never mistaken for a transient timeout.
//!
//! Retry decisions:
//! - retryable status with retries left: wait, then try again. A 429 honours
//!   a parseable `Retry-After`; everything else uses full-jitter backoff
//! - non-retryable status, or out of retries: `FetchError::Api`
//! - attempt deadline hit: retried like a transient status, `Timeout` at the end
//! - connection failure: retried likewise, `Transport` at the end
//! - cancellation: `Cancelled` immediately, at any point

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tower::{BoxError, Service, ServiceExt};
use tracing::{debug, warn};

use crate::backoff;
use crate::config::RetryPolicy;
use crate::error::{FetchError, Result};
use crate::observability::{EventSink, FailureKind, FetchEvent, NoopSink};
use crate::rate_limit::RateLimiter;
use crate::retry_after;
use crate::transport::{ApiRequest, ApiResponse, NoToken, TokenSource};

const TOO_MANY_REQUESTS: u16 = 429;

/// A successful response plus the attempt that produced it. The success
/// event is emitted by the caller once the body is known to be usable.
struct Delivered {
    response: ApiResponse,
    attempt: usize,
    started: Instant,
}

pub struct Executor<T> {
    transport: T,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    request_timeout: Duration,
    token: Arc<dyn TokenSource>,
    sink: Arc<dyn EventSink>,
}

impl<T> Executor<T> {
    pub fn new(
        transport: T,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            limiter,
            retry,
            request_timeout,
            token: Arc::new(NoToken),
            sink: Arc::new(NoopSink),
        }
    }

    pub fn with_token(mut self, token: Arc<dyn TokenSource>) -> Self {
        self.token = token;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn backoff(&self, attempt: usize) -> Duration {
        let attempt = u32::try_from(attempt).unwrap_or(u32::MAX);
        backoff::delay(attempt, self.retry.base_delay, self.retry.max_delay)
    }

    fn failed(&self, attempt: usize, status: Option<u16>, kind: FailureKind, started: Instant) {
        self.sink.emit(FetchEvent::RequestFailed {
            attempt,
            status,
            kind,
            duration: started.elapsed(),
        });
    }
}

impl<T> Executor<T>
where
    T: Service<ApiRequest, Response = ApiResponse, Error = BoxError> + Clone + Send + Sync + 'static,
    T::Future: Send + 'static,
{
    /// Issue `request` and return the first successful response.
    pub async fn execute(
        &self,
        request: ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse> {
        let delivered = self.attempt_until_success(request, cancel).await?;
        self.succeeded(&delivered);
        Ok(delivered.response)
    }

    /// [`execute`](Self::execute), then decode the body as JSON. Decode
    /// failures are not retried and are reported against the attempt that
    /// returned the body.
    pub async fn execute_json<D: DeserializeOwned>(
        &self,
        request: ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<D> {
        let delivered = self.attempt_until_success(request, cancel).await?;
        match serde_json::from_str(&delivered.response.body) {
            Ok(decoded) => {
                self.succeeded(&delivered);
                Ok(decoded)
            }
            Err(e) => {
                self.failed(
                    delivered.attempt,
                    Some(delivered.response.status),
                    FailureKind::Decode,
                    delivered.started,
                );
                Err(FetchError::Decode(e))
            }
        }
    }

    fn succeeded(&self, delivered: &Delivered) {
        self.sink.emit(FetchEvent::RequestSucceeded {
            attempt: delivered.attempt,
            status: delivered.response.status,
            duration: delivered.started.elapsed(),
        });
    }

    async fn attempt_until_success(
        &self,
        request: ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<Delivered> {
        // Retries reuse this admission.
        self.limiter.acquire(cancel).await?;

        let mut attempt = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let mut req = request.clone();
            req.bearer = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                token = self.token.token() => token,
            };
            let mut svc = self.transport.clone();
            let started = Instant::now();
            let call = async move { svc.ready().await?.call(req).await };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.failed(attempt, None, FailureKind::Cancelled, started);
                    return Err(FetchError::Cancelled);
                }
                r = timeout(self.request_timeout, call) => r,
            };

            let retries_left = attempt < self.retry.max_retries;
            let (kind, delay, from_retry_after) = match result {
                Ok(Ok(resp)) if resp.is_success() => {
                    return Ok(Delivered {
                        response: resp,
                        attempt,
                        started,
                    });
                }
                Ok(Ok(resp)) => {
                    self.failed(attempt, Some(resp.status), FailureKind::Status, started);
                    if !retries_left || !self.retry.is_retryable(resp.status) {
                        warn!(status = resp.status, attempt, path = %request.path, "request failed");
                        return Err(FetchError::Api {
                            status: resp.status,
                            body: resp.body,
                        });
                    }
                    let hinted = if resp.status == TOO_MANY_REQUESTS {
                        resp.retry_after.as_deref().and_then(retry_after::parse)
                    } else {
                        None
                    };
                    match hinted {
                        Some(d) => (FailureKind::Status, d, true),
                        None => (FailureKind::Status, self.backoff(attempt), false),
                    }
                }
                Ok(Err(e)) => {
                    self.failed(attempt, None, FailureKind::Transport, started);
                    if !retries_left {
                        warn!(error = %e, attempt, path = %request.path, "transport failure, retries exhausted");
                        return Err(FetchError::Transport(e.to_string()));
                    }
                    (FailureKind::Transport, self.backoff(attempt), false)
                }
                Err(_elapsed) => {
                    self.failed(attempt, None, FailureKind::Timeout, started);
                    if !retries_left {
                        warn!(attempt, path = %request.path, "attempt deadline exceeded, retries exhausted");
                        return Err(FetchError::Timeout {
                            attempts: attempt + 1,
                        });
                    }
                    (FailureKind::Timeout, self.backoff(attempt), false)
                }
            };

            self.sink.emit(FetchEvent::RetryScheduled {
                attempt,
                delay,
                kind,
                from_retry_after,
            });
            debug!(attempt, delay_ms = delay.as_millis() as u64, ?kind, "retrying request");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::observability::RecordingSink;
    use crate::transport::StaticToken;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tower::service_fn;

    fn fast_retry(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            ..Default::default()
        }
    }

    fn limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateLimitConfig {
            window: Duration::from_millis(100),
            max_requests: 1000,
        }))
    }

    /// Transport that replays `script` in order, repeating the last entry.
    #[derive(Clone)]
    struct Scripted {
        script: Arc<Vec<ApiResponse>>,
        calls: Arc<AtomicUsize>,
    }

    impl Service<ApiRequest> for Scripted {
        type Response = ApiResponse;
        type Error = BoxError;
        type Future = futures::future::Ready<std::result::Result<ApiResponse, BoxError>>;

        fn poll_ready(
            &mut self,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::result::Result<(), BoxError>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: ApiRequest) -> Self::Future {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let idx = n.min(self.script.len() - 1);
            futures::future::ready(Ok(self.script[idx].clone()))
        }
    }

    fn scripted(script: Vec<ApiResponse>, calls: Arc<AtomicUsize>) -> Scripted {
        Scripted {
            script: Arc::new(script),
            calls,
        }
    }

    #[tokio::test]
    async fn retries_transient_status_then_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = RecordingSink::new();
        let svc = scripted(
            vec![
                ApiResponse::new(503, "busy"),
                ApiResponse::new(502, "bad gateway"),
                ApiResponse::new(200, "{}"),
            ],
            calls.clone(),
        );
        let exec = Executor::new(svc, limiter(), fast_retry(3), Duration::from_secs(1))
            .with_sink(Arc::new(sink.clone()));
        let resp = exec
            .execute(ApiRequest::get("worklogs"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.count("retry_scheduled"), 2);
        assert_eq!(sink.count("request_failed"), 2);
        assert_eq!(sink.count("request_succeeded"), 1);
    }

    #[tokio::test]
    async fn non_retryable_status_fails_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let svc = scripted(vec![ApiResponse::new(404, "not found")], calls.clone());
        let exec = Executor::new(svc, limiter(), fast_retry(3), Duration::from_secs(1));
        let err = exec
            .execute(ApiRequest::get("worklogs"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Api { status: 404, ref body } if body == "not found"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_api_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let svc = scripted(vec![ApiResponse::new(500, "boom")], calls.clone());
        let exec = Executor::new(svc, limiter(), fast_retry(2), Duration::from_secs(1));
        let err = exec
            .execute(ApiRequest::get("worklogs"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn too_many_requests_honours_retry_after() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = RecordingSink::new();
        let svc = scripted(
            vec![
                ApiResponse::new(429, "slow down").with_retry_after("2"),
                ApiResponse::new(200, "{}"),
            ],
            calls.clone(),
        );
        let exec = Executor::new(svc, limiter(), fast_retry(3), Duration::from_secs(5))
            .with_sink(Arc::new(sink.clone()));
        let start = Instant::now();
        exec.execute(ApiRequest::get("worklogs"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(sink.events().iter().any(|e| matches!(
            e,
            FetchEvent::RetryScheduled { from_retry_after: true, delay, .. } if *delay == Duration::from_secs(2)
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn unparseable_retry_after_falls_back_to_backoff() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = RecordingSink::new();
        let svc = scripted(
            vec![
                ApiResponse::new(429, "").with_retry_after("0"),
                ApiResponse::new(200, "{}"),
            ],
            calls.clone(),
        );
        let exec = Executor::new(svc, limiter(), fast_retry(1), Duration::from_secs(5))
            .with_sink(Arc::new(sink.clone()));
        exec.execute(ApiRequest::get("worklogs"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(sink.events().iter().any(|e| matches!(
            e,
            FetchEvent::RetryScheduled { from_retry_after: false, .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_deadline_retries_then_times_out() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cl = calls.clone();
        let svc = service_fn(move |_req: ApiRequest| {
            calls_cl.fetch_add(1, Ordering::SeqCst);
            async move {
                sleep(Duration::from_secs(60)).await;
                Ok::<_, BoxError>(ApiResponse::new(200, "{}"))
            }
        });
        let exec = Executor::new(svc, limiter(), fast_retry(2), Duration::from_millis(50));
        let err = exec
            .execute(ApiRequest::get("worklogs"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout { attempts: 3 }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_call_without_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cl = calls.clone();
        let svc = service_fn(move |_req: ApiRequest| {
            calls_cl.fetch_add(1, Ordering::SeqCst);
            async move {
                sleep(Duration::from_secs(30)).await;
                Ok::<_, BoxError>(ApiResponse::new(200, "{}"))
            }
        });
        let exec = Executor::new(svc, limiter(), fast_retry(5), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let start = std::time::Instant::now();
        let err = exec
            .execute(ApiRequest::get("worklogs"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_stops_retrying() {
        let calls = Arc::new(AtomicUsize::new(0));
        let svc = scripted(vec![ApiResponse::new(503, "")], calls.clone());
        let retry = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let exec = Executor::new(svc, limiter(), retry, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = exec
            .execute(ApiRequest::get("worklogs"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_do_not_reacquire_admission() {
        let calls = Arc::new(AtomicUsize::new(0));
        let svc = scripted(
            vec![
                ApiResponse::new(503, ""),
                ApiResponse::new(503, ""),
                ApiResponse::new(200, "{}"),
            ],
            calls.clone(),
        );
        let one_per_minute = Arc::new(RateLimiter::new(RateLimitConfig {
            window: Duration::from_secs(60),
            max_requests: 1,
        }));
        let exec = Executor::new(svc, one_per_minute, fast_retry(3), Duration::from_secs(1));
        let start = Instant::now();
        exec.execute(ApiRequest::get("worklogs"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transport_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cl = calls.clone();
        let svc = service_fn(move |_req: ApiRequest| {
            let n = calls_cl.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err::<ApiResponse, BoxError>("connection reset".into())
                } else {
                    Ok(ApiResponse::new(200, "{}"))
                }
            }
        });
        let exec = Executor::new(svc, limiter(), fast_retry(1), Duration::from_secs(1));
        exec.execute(ApiRequest::get("worklogs"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn bearer_token_attached_and_json_decoded() {
        let seen = Arc::new(Mutex::new(None));
        let seen_cl = seen.clone();
        let svc = service_fn(move |req: ApiRequest| {
            *seen_cl.lock().unwrap() = req.bearer.clone();
            async move { Ok::<_, BoxError>(ApiResponse::new(200, r#"{"total": 7}"#)) }
        });
        let exec = Executor::new(svc, limiter(), fast_retry(0), Duration::from_secs(1))
            .with_token(Arc::new(StaticToken::new("tok")));
        let v: serde_json::Value = exec
            .execute_json(ApiRequest::get("worklogs"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(v["total"], 7);
        assert_eq!(seen.lock().unwrap().as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn malformed_body_is_decode_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let svc = scripted(vec![ApiResponse::new(200, "<html>")], calls.clone());
        let exec = Executor::new(svc, limiter(), fast_retry(3), Duration::from_secs(1));
        let err = exec
            .execute_json::<serde_json::Value>(ApiRequest::get("worklogs"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn decode_failure_reported_against_delivering_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = RecordingSink::new();
        let svc = scripted(
            vec![ApiResponse::new(503, ""), ApiResponse::new(200, "<html>")],
            calls.clone(),
        );
        let exec = Executor::new(svc, limiter(), fast_retry(3), Duration::from_secs(1))
            .with_sink(Arc::new(sink.clone()));
        let err = exec
            .execute_json::<serde_json::Value>(ApiRequest::get("worklogs"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
        assert_eq!(sink.count("request_succeeded"), 0);
        assert!(sink.events().iter().any(|e| matches!(
            e,
            FetchEvent::RequestFailed { attempt: 1, status: Some(200), kind: FailureKind::Decode, .. }
        )));
    }

    struct StalledToken;

    #[async_trait::async_trait]
    impl TokenSource for StalledToken {
        async fn token(&self) -> Option<String> {
            sleep(Duration::from_secs(30)).await;
            Some("late".into())
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_token_lookup() {
        let calls = Arc::new(AtomicUsize::new(0));
        let svc = scripted(vec![ApiResponse::new(200, "{}")], calls.clone());
        let exec = Executor::new(svc, limiter(), fast_retry(3), Duration::from_secs(60))
            .with_token(Arc::new(StalledToken));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let start = std::time::Instant::now();
        let err = exec
            .execute(ApiRequest::get("worklogs"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
