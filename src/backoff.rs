//! Full-jitter exponential backoff
//!
//! `delay(attempt) = min(base * 2^attempt, max) * uniform(0.5, 1.0)`. The
//! 50% floor keeps retries from collapsing to near-zero waits.

use rand::Rng;
use std::time::Duration;

/// Capped exponential delay for a 0-indexed `attempt`, before jitter.
pub fn capped(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = base.as_millis().min(u64::MAX as u128) as u64;
    let max_ms = max.as_millis().min(u64::MAX as u128) as u64;
    let mult = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(mult).min(max_ms))
}

/// Jittered delay using the thread-local RNG.
pub fn delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    delay_with_rng(attempt, base, max, &mut rand::thread_rng())
}

/// Jittered delay drawing from `rng`; deterministic for a seeded source.
pub fn delay_with_rng<R: Rng + ?Sized>(
    attempt: u32,
    base: Duration,
    max: Duration,
    rng: &mut R,
) -> Duration {
    let cap_ms = capped(attempt, base, max).as_millis() as u64;
    let factor: f64 = rng.gen_range(0.5..=1.0);
    let jittered = ((cap_ms as f64) * factor) as u64;
    Duration::from_millis(jittered.min(cap_ms))
}
