//! Tiered bulk scheduling
//!
//! Fetches many subjects by driving the pagination engine once per subject,
//! always filtered server-side. The subject count picks the strategy:
//!
//! - small cohorts run strictly one subject at a time
//! - medium and large cohorts run in sequential batches, each batch fanning
//!   out to at most the tier's concurrency (tokio `Semaphore`)
//!
//! Every subject gets its own [`FetchBudget`]. Over the whole call sits a
//! [`CircuitBreaker`] with coarser ceilings; once it trips no new subject is
//! started and the bulk result is marked truncated. The breaker and the
//! per-subject budgets are independent: whichever trips first wins.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::{BoxError, Service};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::budgets::FetchBudget;
use crate::config::{BreakerLimits, BudgetLimits, BulkTierConfig, ClientConfig};
use crate::error::{FetchError, Result};
use crate::observability::{EventSink, FetchEvent};
use crate::outcome::{BulkOutcome, FetchOutcome};
use crate::pagination::Paginator;
use crate::time_range::TimeRange;
use crate::transport::{ApiRequest, ApiResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Small,
    Medium,
    Large,
}

/// How a cohort of a given size is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub tier: Tier,
    pub batch_size: usize,
    pub concurrency: usize,
}

impl BatchPlan {
    pub fn for_count(tiers: &BulkTierConfig, count: usize) -> Self {
        if count <= tiers.small_threshold {
            BatchPlan {
                tier: Tier::Small,
                batch_size: count.max(1),
                concurrency: 1,
            }
        } else if count <= tiers.medium_threshold {
            BatchPlan {
                tier: Tier::Medium,
                batch_size: tiers.medium_batch_size.max(1),
                concurrency: tiers.medium_concurrency.max(1),
            }
        } else {
            BatchPlan {
                tier: Tier::Large,
                batch_size: tiers.large_batch_size.max(1),
                concurrency: tiers.large_concurrency.max(1),
            }
        }
    }

    pub fn batches<'a>(&self, subjects: &'a [String]) -> std::slice::Chunks<'a, String> {
        subjects.chunks(self.batch_size)
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    records: usize,
    pages: usize,
    completed: usize,
    tripped: bool,
}

/// Operation-spanning ceiling over all subjects of one bulk call.
pub struct CircuitBreaker {
    limits: BreakerLimits,
    started: Instant,
    state: Mutex<BreakerState>,
    sink: Arc<dyn EventSink>,
}

impl CircuitBreaker {
    pub fn new(limits: BreakerLimits, sink: Arc<dyn EventSink>) -> Self {
        Self {
            limits,
            started: Instant::now(),
            state: Mutex::new(BreakerState::default()),
            sink,
        }
    }

    /// Whether a new subject may start. Trips on the time ceiling.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.tripped && self.started.elapsed() > self.limits.max_duration {
            self.trip(&mut state);
        }
        !state.tripped
    }

    /// Account for a finished subject.
    pub fn record(&self, outcome: &FetchOutcome) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.completed += 1;
        state.records = state.records.saturating_add(outcome.records().len());
        state.pages = state.pages.saturating_add(outcome.pages_fetched());
        if !state.tripped
            && (state.records > self.limits.max_total_records
                || state.pages > self.limits.max_total_pages)
        {
            self.trip(&mut state);
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).tripped
    }

    fn trip(&self, state: &mut BreakerState) {
        state.tripped = true;
        warn!(
            completed = state.completed,
            records = state.records,
            pages = state.pages,
            "bulk circuit breaker tripped, no new subjects will start"
        );
        self.sink.emit(FetchEvent::CircuitBreakerTripped {
            subjects_completed: state.completed,
            total_records: state.records,
            total_pages: state.pages,
        });
    }
}

pub struct BulkScheduler<T> {
    paginator: Arc<Paginator<T>>,
    tiers: BulkTierConfig,
    budget: BudgetLimits,
    breaker: BreakerLimits,
    sink: Arc<dyn EventSink>,
}

impl<T> BulkScheduler<T> {
    pub fn new(
        paginator: Arc<Paginator<T>>,
        tiers: BulkTierConfig,
        budget: BudgetLimits,
        breaker: BreakerLimits,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            paginator,
            tiers,
            budget,
            breaker,
            sink,
        }
    }

    pub fn from_config(
        paginator: Arc<Paginator<T>>,
        config: &ClientConfig,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self::new(paginator, config.tiers, config.budget, config.breaker, sink)
    }

    pub fn plan(&self, count: usize) -> BatchPlan {
        BatchPlan::for_count(&self.tiers, count)
    }
}

impl<T> BulkScheduler<T>
where
    T: Service<ApiRequest, Response = ApiResponse, Error = BoxError> + Clone + Send + Sync + 'static,
    T::Future: Send + 'static,
{
    /// Fetch `range` for every subject in `subject_ids`.
    ///
    /// Repeated ids are fetched once. Cancellation fails the whole call.
    #[instrument(
        level = "info",
        skip_all,
        fields(operation_id = %Uuid::new_v4(), subjects = subject_ids.len())
    )]
    pub async fn fetch_for_subjects(
        &self,
        subject_ids: &[String],
        range: TimeRange,
        cancel: &CancellationToken,
    ) -> Result<BulkOutcome> {
        let mut seen = HashSet::new();
        let subjects: Vec<String> = subject_ids
            .iter()
            .filter(|s| seen.insert(s.as_str()))
            .cloned()
            .collect();

        let plan = self.plan(subjects.len());
        info!(tier = ?plan.tier, batch_size = plan.batch_size, concurrency = plan.concurrency, "starting bulk fetch");

        let breaker = Arc::new(CircuitBreaker::new(self.breaker, self.sink.clone()));
        let mut bulk = BulkOutcome::default();

        for (batch_no, batch) in plan.batches(&subjects).enumerate() {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            debug!(batch_no, size = batch.len(), "starting batch");
            if plan.tier == Tier::Small {
                self.run_sequential(batch, range, &breaker, cancel, &mut bulk)
                    .await?;
            } else {
                self.run_concurrent(batch, plan.concurrency, range, &breaker, cancel, &mut bulk)
                    .await?;
            }
        }

        bulk.truncated = breaker.is_tripped();
        info!(
            fetched = bulk.subjects.len(),
            skipped = bulk.skipped.len(),
            records = bulk.total_records(),
            truncated = bulk.truncated,
            "bulk fetch finished"
        );
        Ok(bulk)
    }

    async fn run_sequential(
        &self,
        batch: &[String],
        range: TimeRange,
        breaker: &CircuitBreaker,
        cancel: &CancellationToken,
        bulk: &mut BulkOutcome,
    ) -> Result<()> {
        for subject in batch {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            if !breaker.allow() {
                bulk.skipped.push(subject.clone());
                continue;
            }
            let mut budget = FetchBudget::new(self.budget);
            let outcome = self
                .paginator
                .fetch_all(Some(subject), range, &mut budget, cancel)
                .await?;
            breaker.record(&outcome);
            bulk.subjects.insert(subject.clone(), outcome);
        }
        Ok(())
    }

    async fn run_concurrent(
        &self,
        batch: &[String],
        concurrency: usize,
        range: TimeRange,
        breaker: &Arc<CircuitBreaker>,
        cancel: &CancellationToken,
        bulk: &mut BulkOutcome,
    ) -> Result<()> {
        let sem = Arc::new(Semaphore::new(concurrency));
        let mut handles = Vec::with_capacity(batch.len());

        for subject in batch {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                permit = sem.clone().acquire_owned() => {
                    permit.map_err(|e| FetchError::Task(e.to_string()))?
                }
            };
            // Checked after the permit so finished subjects have been counted.
            if !breaker.allow() {
                bulk.skipped.push(subject.clone());
                continue;
            }

            let paginator = self.paginator.clone();
            let breaker = breaker.clone();
            let cancel = cancel.clone();
            let limits = self.budget;
            let subject = subject.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let mut budget = FetchBudget::new(limits);
                let result = paginator
                    .fetch_all(Some(&subject), range, &mut budget, &cancel)
                    .await;
                if let Ok(outcome) = &result {
                    breaker.record(outcome);
                }
                (subject, result)
            }));
        }

        let mut first_err: Option<FetchError> = None;
        for handle in handles {
            match handle.await {
                Ok((subject, Ok(outcome))) => {
                    bulk.subjects.insert(subject, outcome);
                }
                Ok((_, Err(e))) => {
                    first_err.get_or_insert(e);
                }
                Err(join) => {
                    first_err.get_or_insert(FetchError::Task(join.to_string()));
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
