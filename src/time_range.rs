//! Time ranges and chunking
//!
//! Long ranges are queried as consecutive half-open chunks of at most
//! [`MAX_CHUNK_DAYS`] days.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FetchError, Result};

pub const MAX_CHUNK_DAYS: i64 = 90;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(FetchError::InvalidRange {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(Self { start, end })
    }

    pub fn span(&self) -> Duration {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// First calendar day covered.
    pub fn from_date(&self) -> NaiveDate {
        self.start.date_naive()
    }

    /// Last calendar day covered, for APIs whose upper bound is inclusive.
    pub fn to_date(&self) -> NaiveDate {
        let last = (self.end - Duration::seconds(1)).date_naive();
        last.max(self.from_date())
    }

    pub fn split(&self) -> Vec<TimeRange> {
        split(self.start, self.end)
    }
}

/// Split `[start, end)` into chunks of at most [`MAX_CHUNK_DAYS`].
pub fn split(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<TimeRange> {
    split_with_span(start, end, Duration::days(MAX_CHUNK_DAYS))
}

/// Split `[start, end)` into consecutive chunks no longer than `max_span`.
///
/// Chunks touch at their boundaries and the last one ends exactly at `end`.
/// An empty or inverted range yields no chunks.
pub fn split_with_span(start: DateTime<Utc>, end: DateTime<Utc>, max_span: Duration) -> Vec<TimeRange> {
    if start >= end || max_span <= Duration::zero() {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let chunk_end = cursor
            .checked_add_signed(max_span)
            .map_or(end, |e| e.min(end));
        chunks.push(TimeRange {
            start: cursor,
            end: chunk_end,
        });
        cursor = chunk_end;
    }
    chunks
}
