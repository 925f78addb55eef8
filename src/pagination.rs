//! Pagination engine
//!
//! Drains one (subject, range) query: the range is split into chunks, each
//! chunk is paged through sequentially, and results are merged into a single
//! deduplicated [`FetchOutcome`]. Any budget ceiling or failed page aborts the
//! whole operation and is recorded as a truncation reason; records gathered
//! up to that point are kept. Cancellation is the one failure that is
//! returned as an error.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower::{BoxError, Service};
use tracing::{debug, instrument, warn};

use crate::budgets::FetchBudget;
use crate::config::ClientConfig;
use crate::error::{FetchError, Result};
use crate::executor::Executor;
use crate::outcome::{FetchOutcome, TruncationReason};
use crate::records::WorklogPage;
use crate::time_range::TimeRange;
use crate::transport::{ApiRequest, ApiResponse};

/// Parameters of a single page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageQuery<'a> {
    pub subject_filter: Option<&'a str>,
    pub chunk: TimeRange,
    pub page_index: usize,
    pub page_size: usize,
}

impl PageQuery<'_> {
    pub fn offset(&self) -> usize {
        self.page_index * self.page_size
    }

    pub fn to_request(&self, path: &str, filter_key: &str) -> ApiRequest {
        let mut req = ApiRequest::get(path)
            .query("from", self.chunk.from_date())
            .query("to", self.chunk.to_date())
            .query("offset", self.offset())
            .query("limit", self.page_size);
        if let Some(subject) = self.subject_filter {
            req = req.query(filter_key, subject);
        }
        req
    }
}

pub struct Paginator<T> {
    executor: Arc<Executor<T>>,
    path: String,
    filter_key: String,
    page_size: usize,
}

impl<T> Paginator<T> {
    pub fn new(
        executor: Arc<Executor<T>>,
        path: impl Into<String>,
        filter_key: impl Into<String>,
        page_size: usize,
    ) -> Self {
        Self {
            executor,
            path: path.into(),
            filter_key: filter_key.into(),
            page_size: page_size.max(1),
        }
    }

    pub fn from_config(executor: Arc<Executor<T>>, config: &ClientConfig) -> Self {
        Self::new(
            executor,
            config.worklogs_path.clone(),
            config.subject_filter_key.clone(),
            config.page_size,
        )
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

impl<T> Paginator<T>
where
    T: Service<ApiRequest, Response = ApiResponse, Error = BoxError> + Clone + Send + Sync + 'static,
    T::Future: Send + 'static,
{
    /// Fetch every record for `subject_filter` (or everyone, when `None`) in
    /// `range`, within `budget`.
    #[instrument(level = "debug", skip(self, budget, cancel), fields(chunks = tracing::field::Empty))]
    pub async fn fetch_all(
        &self,
        subject_filter: Option<&str>,
        range: TimeRange,
        budget: &mut FetchBudget,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let chunks = range.split();
        tracing::Span::current().record("chunks", chunks.len() as u64);
        let mut outcome = FetchOutcome::new(chunks.len() > 1);

        'chunks: for chunk in chunks {
            let mut page_index = 0usize;
            loop {
                if let Some(reason) = budget.exhausted_by() {
                    outcome.truncate(reason);
                    break 'chunks;
                }
                if cancel.is_cancelled() {
                    return Err(FetchError::Cancelled);
                }
                if let Some(reason) = budget.check_elapsed() {
                    outcome.truncate(reason);
                    break 'chunks;
                }

                let query = PageQuery {
                    subject_filter,
                    chunk,
                    page_index,
                    page_size: self.page_size,
                };
                let request = query.to_request(&self.path, &self.filter_key);
                let page: WorklogPage = match self.executor.execute_json(request, cancel).await {
                    Ok(page) => page,
                    Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                    Err(e) => {
                        warn!(
                            error = %e,
                            page_index,
                            chunk_start = %chunk.start,
                            "page fetch failed, keeping records gathered so far"
                        );
                        budget.exhaust(TruncationReason::FetchError);
                        outcome.truncate(TruncationReason::FetchError);
                        break 'chunks;
                    }
                };

                outcome.count_page();
                let more = page.has_more(page_index, self.page_size);
                let received = page.results.len();
                outcome.merge(page.results);

                let tripped = budget.record_page(received);
                if !tripped.is_empty() {
                    for reason in tripped {
                        outcome.truncate(reason);
                    }
                    break 'chunks;
                }
                if !more {
                    break;
                }
                page_index += 1;
            }
        }

        debug!(
            records = outcome.records().len(),
            pages = outcome.pages_fetched(),
            truncated = outcome.truncated(),
            "fetch finished"
        );
        Ok(outcome)
    }
}
