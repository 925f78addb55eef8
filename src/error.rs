//! Error types for worklog fetching

use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, FetchError>;

/// Failure of a logical fetch.
///
/// Truncation is not represented here: a budget or partial-failure boundary
/// yields a flagged [`FetchOutcome`](crate::FetchOutcome), never an error.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The caller's cancellation token fired
    #[error("fetch cancelled")]
    Cancelled,

    /// Every attempt hit the per-attempt deadline
    #[error("request timed out after {attempts} attempt(s)")]
    Timeout { attempts: usize },

    /// Non-success status from the upstream API
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    /// Connection-level failure that outlived its retries
    #[error("transport error: {0}")]
    Transport(String),

    /// Response body could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Time range with `start` after `end`
    #[error("invalid time range: {start} is after {end}")]
    InvalidRange { start: String, end: String },

    /// Rejected configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A spawned per-subject task panicked or was aborted
    #[error("subject task failed: {0}")]
    Task(String),
}

impl FetchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}
