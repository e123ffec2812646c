use std::time::Duration;

use crate::{
    RateLimitResult, Rule,
    token_bucket::{self, BucketState, retry_after_seconds},
};

const T0: u64 = 1_704_067_200_000;

fn per_minute(limit: u64) -> Rule {
    Rule::new(limit, Duration::from_secs(60)).unwrap()
}

/// Evaluate `times` requests at `now_ms`, returning the final state and results.
fn drain(
    mut state: BucketState,
    rule: &Rule,
    now_ms: u64,
    times: usize,
) -> (BucketState, Vec<RateLimitResult>) {
    let mut results = Vec::with_capacity(times);
    for _ in 0..times {
        let (next, result) = token_bucket::evaluate(state, rule, now_ms);
        state = next;
        results.push(result);
    }
    (state, results)
}

#[test]
fn first_request_on_full_bucket_is_allowed() {
    let rule = per_minute(10);
    let (state, result) = token_bucket::evaluate(BucketState::full(&rule, T0), &rule, T0);

    assert_eq!(
        result,
        RateLimitResult {
            allowed: true,
            limit: 10,
            remaining: 9,
            retry_after_seconds: None,
        }
    );
    assert_eq!(state.available_tokens, 9.0);
    assert_eq!(state.last_refill_ms, T0);
}

#[test]
fn exactly_capacity_requests_are_allowed_in_one_instant() {
    let rule = per_minute(10);
    let (_, results) = drain(BucketState::full(&rule, T0), &rule, T0, 11);

    let remaining: Vec<u64> = results.iter().take(10).map(|r| r.remaining).collect();
    assert_eq!(remaining, vec![9, 8, 7, 6, 5, 4, 3, 2, 1, 0]);
    assert!(results.iter().take(10).all(|r| r.allowed));

    let denied = results[10];
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, 0);
    assert_eq!(denied.retry_after_seconds, Some(6));
}

#[test]
fn refill_after_thirty_seconds_leaves_four_remaining() {
    let rule = per_minute(10);
    let (state, _) = drain(BucketState::full(&rule, T0), &rule, T0, 10);

    let (_, result) = token_bucket::evaluate(state, &rule, T0 + 30_000);

    assert!(result.allowed);
    assert_eq!(result.remaining, 4);
}

#[test]
fn retry_after_two_seconds_is_exactly_four() {
    let rule = per_minute(10);
    let (state, _) = drain(BucketState::full(&rule, T0), &rule, T0, 10);

    let (state, result) = token_bucket::evaluate(state, &rule, T0 + 2_000);

    assert!(!result.allowed);
    assert_eq!(result.remaining, 0);
    assert_eq!(result.retry_after_seconds, Some(4));

    // the fractional refill is kept for the next evaluation
    assert!((state.available_tokens - 2.0 / 6.0).abs() < 1e-9);
    assert_eq!(state.last_refill_ms, T0 + 2_000);
}

#[test]
fn fractional_tokens_carry_over_denials() {
    let rule = per_minute(10);
    let (state, _) = drain(BucketState::full(&rule, T0), &rule, T0, 10);

    let (state, denied) = token_bucket::evaluate(state, &rule, T0 + 2_000);
    assert!(!denied.allowed);

    // 2s + 8s = 10s of refill, 1.67 tokens
    let (_, allowed) = token_bucket::evaluate(state, &rule, T0 + 10_000);
    assert!(allowed.allowed);
    assert_eq!(allowed.remaining, 0);
}

#[test]
fn half_second_window_denies_second_request() {
    let rule = Rule::new(1, Duration::from_millis(500)).unwrap();
    let (_, results) = drain(BucketState::full(&rule, T0), &rule, T0, 2);

    assert!(results[0].allowed);
    assert!(!results[1].allowed);
    assert_eq!(results[1].retry_after_seconds, Some(1));
}

#[test]
fn capacity_is_never_exceeded_after_long_idle() {
    let rule = per_minute(10);
    let (state, _) = drain(BucketState::full(&rule, T0), &rule, T0, 3);

    let (state, result) = token_bucket::evaluate(state, &rule, T0 + 86_400_000);

    assert!(result.allowed);
    assert_eq!(result.remaining, 9);
    assert!(state.available_tokens <= rule.bucket_capacity() as f64);
}

#[test]
fn burst_capacity_above_limit_is_honoured() {
    let rule = per_minute(10).with_bucket_capacity(20);
    let (_, results) = drain(BucketState::full(&rule, T0), &rule, T0, 21);

    assert_eq!(results.iter().filter(|r| r.allowed).count(), 20);
    assert!(results.iter().all(|r| r.limit == 10));
}

#[test]
fn zero_limit_always_denies_without_retry_after() {
    let rule = per_minute(0);

    let mut state = BucketState::full(&rule, T0);
    for step in 0..5 {
        let (next, result) = token_bucket::evaluate(state, &rule, T0 + step * 60_000);
        state = next;

        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.retry_after_seconds, None);
    }
}

#[test]
fn zero_refill_rate_denies_without_retry_after() {
    let rule = per_minute(2).with_refill_rate(0.0).unwrap();
    let (state, results) = drain(BucketState::full(&rule, T0), &rule, T0, 3);

    assert!(results[0].allowed && results[1].allowed);
    assert!(!results[2].allowed);
    assert_eq!(results[2].retry_after_seconds, None);

    let (_, later) = token_bucket::evaluate(state, &rule, T0 + 3_600_000);
    assert!(!later.allowed);
}

#[test]
fn clock_moving_backwards_adds_no_tokens() {
    let rule = per_minute(10);
    let (state, _) = drain(BucketState::full(&rule, T0), &rule, T0, 10);

    let (state, result) = token_bucket::evaluate(state, &rule, T0 - 30_000);

    assert!(!result.allowed);
    assert_eq!(state.available_tokens, 0.0);
    assert_eq!(state.last_refill_ms, T0);
}

#[test]
fn late_commit_does_not_rewind_the_timestamp() {
    let rule = Rule::new(2, Duration::from_secs(2)).unwrap();
    let (state, _) = drain(BucketState::full(&rule, T0), &rule, T0, 2);

    // a newer evaluation commits first, then one carrying an older reading
    let (state, newer) = token_bucket::evaluate(state, &rule, T0 + 2_000);
    let (state, older) = token_bucket::evaluate(state, &rule, T0 + 1_000);
    assert!(newer.allowed);
    assert!(older.allowed);
    assert_eq!(state.last_refill_ms, T0 + 2_000);

    // the interval up to +2s was already credited
    let (_, again) = token_bucket::evaluate(state, &rule, T0 + 2_000);
    assert!(!again.allowed);
}

#[test]
fn one_token_per_second_denies_after_half_a_second() {
    let rule = Rule::new(1, Duration::from_secs(1))
        .unwrap()
        .with_refill_rate(1.0)
        .unwrap();
    assert_eq!(rule.bucket_capacity(), 1);

    let (state, first) = token_bucket::evaluate(BucketState::full(&rule, T0), &rule, T0);
    assert!(first.allowed);

    let (_, second) = token_bucket::evaluate(state, &rule, T0 + 500);
    assert!(!second.allowed);
    assert_eq!(second.remaining, 0);
    assert_eq!(second.retry_after_seconds, Some(1));
}

#[test]
fn retry_after_is_minimal_whole_second_count() {
    for (tokens, rate) in [
        (0.0, 10.0 / 60.0),
        (2.0 / 6.0, 10.0 / 60.0),
        (0.5, 0.25),
        (0.1, 3.0),
        (0.0, 1.0),
        (0.9, 0.001),
    ] {
        let retry = retry_after_seconds(tokens, rate).unwrap();

        // enough time, with a tolerance for the representation error of `tokens`
        assert!(tokens + retry as f64 * rate >= 1.0 - 1e-9, "{tokens} @ {rate}");
        // and one second less would not be
        if retry > 0 {
            assert!(tokens + (retry - 1) as f64 * rate < 1.0 - 1e-9, "{tokens} @ {rate}");
        }
    }
}

#[test]
fn retry_after_absorbs_division_noise() {
    // (1 - 1/3) / (1/6) comes out a hair above 4.0 in floating point
    assert_eq!(retry_after_seconds(1.0 / 3.0, 1.0 / 6.0), Some(4));
    assert_eq!(retry_after_seconds(0.0, 1.0 / 3.0), Some(3));
    assert_eq!(retry_after_seconds(0.5, 0.0), None);
}
