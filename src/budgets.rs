//! Per-fetch budgets: records, pages, and wall-clock time
//!
//! A [`FetchBudget`] is created fresh for one top-level fetch (one subject,
//! one range). Counters only ever grow. Once any ceiling is crossed the budget
//! is exhausted and stays that way; the first reason is remembered.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::BudgetLimits;
use crate::outcome::TruncationReason;

#[derive(Debug, Clone)]
pub struct FetchBudget {
    limits: BudgetLimits,
    records_so_far: usize,
    pages_so_far: usize,
    started_at: Instant,
    exhausted: bool,
    exhausted_by: Option<TruncationReason>,
}

impl FetchBudget {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            records_so_far: 0,
            pages_so_far: 0,
            started_at: Instant::now(),
            exhausted: false,
            exhausted_by: None,
        }
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    pub fn records(&self) -> usize {
        self.records_so_far
    }

    pub fn pages(&self) -> usize {
        self.pages_so_far
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// First reason the budget ran out, if it has.
    pub fn exhausted_by(&self) -> Option<TruncationReason> {
        self.exhausted_by
    }

    /// Stop further requests for `reason`, e.g. after a failed page.
    pub fn exhaust(&mut self, reason: TruncationReason) {
        self.exhausted = true;
        self.exhausted_by.get_or_insert(reason);
    }

    /// Time check performed before each page request.
    pub fn check_elapsed(&mut self) -> Option<TruncationReason> {
        if self.elapsed() > self.limits.max_duration {
            self.exhaust(TruncationReason::Timeout);
            return Some(TruncationReason::Timeout);
        }
        None
    }

    /// Account for a returned page and report every ceiling now exceeded.
    pub fn record_page(&mut self, records: usize) -> Vec<TruncationReason> {
        self.pages_so_far = self.pages_so_far.saturating_add(1);
        self.records_so_far = self.records_so_far.saturating_add(records);

        let mut tripped = Vec::new();
        if self.pages_so_far > self.limits.max_pages {
            tripped.push(TruncationReason::MaxPages);
        }
        if self.records_so_far > self.limits.max_records {
            tripped.push(TruncationReason::MaxRecords);
        }
        if let Some(&first) = tripped.first() {
            self.exhaust(first);
        }
        tripped
    }
}
