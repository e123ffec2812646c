//! Token-bucket arithmetic shared by every backend.
//!
//! The local backend calls [`evaluate`] directly. The Redis backend runs the same
//! steps inside a Lua script and receives [`RETRY_AFTER_PRECISION`] as an argument,
//! so both apply one rounding policy.

use crate::{RateLimitResult, Rule};

/// Decimal places kept before the retry-after ceiling is taken.
///
/// Plain division can produce values like `4.000000000000001`; rounding them away
/// first keeps the ceiling from overstating the wait by a whole second.
pub const RETRY_AFTER_PRECISION: u32 = 9;

/// Persisted state of one bucket.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BucketState {
    /// Tokens currently in the bucket, in `[0, capacity]`.
    pub available_tokens: f64,
    /// Unix milliseconds of the last evaluation.
    pub last_refill_ms: u64,
}

impl BucketState {
    /// A bucket filled to `rule`'s capacity at `now_ms`.
    pub fn full(rule: &Rule, now_ms: u64) -> Self {
        Self {
            available_tokens: rule.bucket_capacity() as f64,
            last_refill_ms: now_ms,
        }
    }
}

/// Refill `state` up to `now_ms`, try to take one token, and return the new state
/// together with the decision.
///
/// The returned state must be persisted whether or not the request was allowed.
/// A `now_ms` earlier than the stored timestamp is treated as zero elapsed time,
/// and the stored timestamp is kept so the same interval is never credited twice.
pub fn evaluate(state: BucketState, rule: &Rule, now_ms: u64) -> (BucketState, RateLimitResult) {
    let capacity = rule.bucket_capacity() as f64;
    let refill_rate = rule.refill_rate();

    // same subtraction the script performs on the timestamps it receives
    let elapsed_seconds =
        (millis_to_seconds(now_ms) - millis_to_seconds(state.last_refill_ms)).max(0.0);
    let mut tokens = (state.available_tokens + elapsed_seconds * refill_rate).min(capacity);

    let result = if tokens >= 1.0 {
        tokens -= 1.0;
        RateLimitResult::allowed(rule.limit(), tokens.floor() as u64)
    } else {
        RateLimitResult::denied(rule.limit(), retry_after_seconds(tokens, refill_rate))
    };

    let state = BucketState {
        available_tokens: tokens,
        last_refill_ms: now_ms.max(state.last_refill_ms),
    };

    (state, result)
}

/// Unix milliseconds as fractional seconds, the unit timestamps are stored in remotely.
pub fn millis_to_seconds(ms: u64) -> f64 {
    ms as f64 / 1000.0
}

/// Whole seconds until `tokens` reaches one, or `None` when the bucket never refills.
pub fn retry_after_seconds(tokens: f64, refill_rate: f64) -> Option<u64> {
    if refill_rate <= 0.0 {
        return None;
    }

    let seconds = round_half_up((1.0 - tokens) / refill_rate, RETRY_AFTER_PRECISION);
    Some(seconds.ceil().max(0.0) as u64)
}

/// `floor(value * 10^places + 0.5) / 10^places`, the form the Lua script can reproduce.
fn round_half_up(value: f64, places: u32) -> f64 {
    let scale = 10f64.powi(places as i32);
    (value * scale + 0.5).floor() / scale
}
