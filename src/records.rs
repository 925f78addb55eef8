//! Worklog records and the upstream page shape

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// One time-stamped unit of work as returned by the API.
///
/// Unknown fields are preserved in `extra` so downstream aggregation can use
/// attributes this crate does not model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRecord {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    #[serde(default, alias = "authorAccountId")]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub time_spent_seconds: u64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subject_id: None,
            started_at: None,
            time_spent_seconds: 0,
            description: None,
            extra: Map::new(),
        }
    }
}

/// Upstream ids are sometimes numeric; dedup works on their string form.
fn id_as_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "worklog id must be a string or number, got {other}"
        ))),
    }
}

/// One page of the listing endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorklogPage {
    #[serde(default)]
    pub results: Vec<WorkRecord>,
    /// Total matching records across all pages, when the API reports it
    #[serde(default)]
    pub total: Option<u64>,
}

impl WorklogPage {
    /// Whether another page follows `page_index`.
    ///
    /// Without a reported total, a full page is taken to mean more may follow.
    pub fn has_more(&self, page_index: usize, page_size: usize) -> bool {
        match self.total {
            Some(total) => ((page_index as u64 + 1) * page_size as u64) < total,
            None => !self.results.is_empty() && self.results.len() >= page_size,
        }
    }
}
