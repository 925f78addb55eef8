//! `Retry-After` header parsing
//!
//! Accepts delay-seconds or an HTTP-date. Anything that would produce a zero
//! or negative wait is treated as absent so callers fall back to backoff.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Parse a `Retry-After` value relative to the current wall clock.
pub fn parse(value: &str) -> Option<Duration> {
    parse_at(value, Utc::now())
}

/// Parse a `Retry-After` value relative to `now`.
pub fn parse_at(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<i64>() {
        return (secs > 0).then(|| Duration::from_secs(secs as u64));
    }
    // RFC 2822 parsing covers the IMF-fixdate form ("Sun, 06 Nov 1994 08:49:37 GMT").
    let when = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    let delta = when.signed_duration_since(now);
    if delta <= chrono::Duration::zero() {
        return None;
    }
    delta.to_std().ok()
}
