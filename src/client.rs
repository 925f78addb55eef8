//! Worklog client: explicit construction of the whole fetch pipeline
//!
//! A client owns one rate limiter shared by every call made through it.
//! Independent clients never share state, so tests and separate pipelines can
//! run side by side.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower::{BoxError, Service};
use tracing::instrument;

use crate::budgets::FetchBudget;
use crate::config::ClientConfig;
use crate::error::{FetchError, Result};
use crate::executor::Executor;
use crate::observability::{EventSink, TracingSink};
use crate::outcome::{BulkOutcome, FetchOutcome};
use crate::pagination::Paginator;
use crate::rate_limit::RateLimiter;
use crate::scheduler::{BatchPlan, BulkScheduler};
use crate::time_range::TimeRange;
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, TokenSource};

pub struct WorklogClient<T = HttpTransport> {
    config: ClientConfig,
    paginator: Arc<Paginator<T>>,
    scheduler: BulkScheduler<T>,
}

impl WorklogClient<HttpTransport> {
    /// Client over HTTP at `config.base_url`, logging events via `tracing`.
    pub fn connect(config: ClientConfig, token: Arc<dyn TokenSource>) -> Result<Self> {
        let transport =
            HttpTransport::new(&config.base_url).map_err(|e| FetchError::Config(e.to_string()))?;
        Self::new(config, transport, token, Arc::new(TracingSink))
    }
}

impl<T> WorklogClient<T> {
    pub fn new(
        config: ClientConfig,
        transport: T,
        token: Arc<dyn TokenSource>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::with_sink(config.rate_limit, sink.clone()));
        let executor = Executor::new(
            transport,
            limiter,
            config.retry.clone(),
            config.request_timeout,
        )
        .with_token(token)
        .with_sink(sink.clone());
        let paginator = Arc::new(Paginator::from_config(Arc::new(executor), &config));
        let scheduler = BulkScheduler::from_config(paginator.clone(), &config, sink);
        Ok(Self {
            config,
            paginator,
            scheduler,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Strategy a bulk call over `count` subjects would use.
    pub fn plan(&self, count: usize) -> BatchPlan {
        self.scheduler.plan(count)
    }
}

impl<T> WorklogClient<T>
where
    T: Service<ApiRequest, Response = ApiResponse, Error = BoxError> + Clone + Send + Sync + 'static,
    T::Future: Send + 'static,
{
    /// All records of one subject in `range`, under a fresh budget.
    #[instrument(level = "info", skip(self, cancel))]
    pub async fn fetch_subject(
        &self,
        subject: &str,
        range: TimeRange,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let mut budget = FetchBudget::new(self.config.budget);
        self.paginator
            .fetch_all(Some(subject), range, &mut budget, cancel)
            .await
    }

    /// All records in `range` without a subject filter.
    #[instrument(level = "info", skip(self, cancel))]
    pub async fn fetch_range(
        &self,
        range: TimeRange,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let mut budget = FetchBudget::new(self.config.budget);
        self.paginator
            .fetch_all(None, range, &mut budget, cancel)
            .await
    }

    /// Records for every subject in `subject_ids`, keyed by subject.
    pub async fn fetch_for_subjects(
        &self,
        subject_ids: &[String],
        range: TimeRange,
        cancel: &CancellationToken,
    ) -> Result<BulkOutcome> {
        self.scheduler
            .fetch_for_subjects(subject_ids, range, cancel)
            .await
    }
}
