//! Fetch results
//!
//! A [`FetchOutcome`] is either complete or explicitly partial. Consumers
//! must read `truncated = true` as "lower bound", not as an error.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::records::WorkRecord;

/// Why a fetch stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationReason {
    MaxPages,
    MaxRecords,
    Timeout,
    FetchError,
}

impl TruncationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TruncationReason::MaxPages => "max_pages",
            TruncationReason::MaxRecords => "max_records",
            TruncationReason::Timeout => "timeout",
            TruncationReason::FetchError => "fetch_error",
        }
    }
}

impl std::fmt::Display for TruncationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deduplicated records of one subject over one range.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchOutcome {
    records: Vec<WorkRecord>,
    truncated: bool,
    truncation_reasons: BTreeSet<TruncationReason>,
    time_sliced: bool,
    pages_fetched: usize,
    #[serde(skip)]
    seen: HashSet<String>,
}

impl FetchOutcome {
    pub fn new(time_sliced: bool) -> Self {
        Self {
            time_sliced,
            ..Default::default()
        }
    }

    /// Append records whose id has not been seen yet; returns how many were new.
    pub fn merge(&mut self, records: impl IntoIterator<Item = WorkRecord>) -> usize {
        let before = self.records.len();
        for record in records {
            if self.seen.insert(record.id.clone()) {
                self.records.push(record);
            }
        }
        self.records.len() - before
    }

    pub fn truncate(&mut self, reason: TruncationReason) {
        self.truncation_reasons.insert(reason);
        self.truncated = true;
    }

    pub(crate) fn count_page(&mut self) {
        self.pages_fetched += 1;
    }

    pub fn records(&self) -> &[WorkRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<WorkRecord> {
        self.records
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn truncation_reasons(&self) -> &BTreeSet<TruncationReason> {
        &self.truncation_reasons
    }

    pub fn time_sliced(&self) -> bool {
        self.time_sliced
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }
}

/// Result of a multi-subject fetch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkOutcome {
    pub subjects: HashMap<String, FetchOutcome>,
    /// Set when the operation-wide circuit breaker halted the run
    pub truncated: bool,
    /// Subjects never fetched because the breaker tripped first
    pub skipped: Vec<String>,
}

impl BulkOutcome {
    pub fn get(&self, subject: &str) -> Option<&FetchOutcome> {
        self.subjects.get(subject)
    }

    pub fn total_records(&self) -> usize {
        self.subjects.values().map(|o| o.records().len()).sum()
    }

    /// True if the run or any subject in it is partial.
    pub fn any_truncated(&self) -> bool {
        self.truncated || self.subjects.values().any(FetchOutcome::truncated)
    }
}
