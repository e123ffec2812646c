use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future::{BoxFuture, join_all};

use crate::{
    AdmissionDecision, AdmissionEngine, AdmissionEngineOptions, AtomicBucketBackend,
    BackendOptions, CircuitBreaker, CircuitBreakerConfig, CircuitState, DistributedOptions,
    FailureMode, LocalTokenBucketOptions, RateLimitResult, Rule, TokengateError,
    clock::{Clock, ManualClock},
    token_bucket::{self, BucketState},
};

use super::runtime::block_on_multi_thread;

/// Shared store that applies the bucket arithmetic under one lock, like a server
/// running the script.
#[derive(Default)]
struct InMemoryBackend {
    buckets: Mutex<HashMap<String, BucketState>>,
    last_now_ms: AtomicU64,
}

impl AtomicBucketBackend for InMemoryBackend {
    fn evaluate<'a>(
        &'a self,
        key: &'a str,
        rule: &'a Rule,
        now_ms: u64,
    ) -> BoxFuture<'a, Result<RateLimitResult, TokengateError>> {
        Box::pin(async move {
            // yield so concurrent callers interleave before the atomic step
            tokio::task::yield_now().await;

            self.last_now_ms.store(now_ms, Ordering::SeqCst);

            let mut buckets = self.buckets.lock().unwrap();
            let state = buckets
                .get(key)
                .copied()
                .unwrap_or_else(|| BucketState::full(rule, now_ms));
            let (next, result) = token_bucket::evaluate(state, rule, now_ms);
            buckets.insert(key.to_string(), next);

            Ok(result)
        })
    }
}

#[derive(Default)]
struct FailingBackend {
    calls: AtomicUsize,
}

impl AtomicBucketBackend for FailingBackend {
    fn evaluate<'a>(
        &'a self,
        _key: &'a str,
        _rule: &'a Rule,
        _now_ms: u64,
    ) -> BoxFuture<'a, Result<RateLimitResult, TokengateError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {
            Err(TokengateError::BackendUnavailable(
                "connection refused".to_string(),
            ))
        })
    }
}

/// Never answers.
struct HangingBackend;

impl AtomicBucketBackend for HangingBackend {
    fn evaluate<'a>(
        &'a self,
        _key: &'a str,
        _rule: &'a Rule,
        _now_ms: u64,
    ) -> BoxFuture<'a, Result<RateLimitResult, TokengateError>> {
        Box::pin(futures::future::pending())
    }
}

fn distributed(
    backend: Arc<dyn AtomicBucketBackend>,
    breaker: CircuitBreakerConfig,
    failure_mode: FailureMode,
) -> (AdmissionEngine, ManualClock) {
    let clock = ManualClock::default();
    let clock_handle: Arc<dyn Clock> = Arc::new(clock.clone());

    let engine = AdmissionEngine::new(AdmissionEngineOptions {
        failure_mode,
        ..AdmissionEngineOptions::new(BackendOptions::Distributed(DistributedOptions {
            backend,
            circuit_breaker: CircuitBreaker::new(breaker).with_clock(clock_handle.clone()),
            clock: clock_handle,
        }))
    });

    (engine, clock)
}

fn local() -> (AdmissionEngine, ManualClock) {
    let clock = ManualClock::default();
    let engine = AdmissionEngine::new(AdmissionEngineOptions::new(BackendOptions::Local(
        LocalTokenBucketOptions {
            clock: Arc::new(clock.clone()),
            ..Default::default()
        },
    )));
    (engine, clock)
}

fn per_minute(limit: u64) -> Rule {
    Rule::new(limit, Duration::from_secs(60)).unwrap()
}

#[test]
fn local_engine_allows_then_denies() {
    block_on_multi_thread(async {
        let (engine, clock) = local();
        let rule = per_minute(2);

        assert!(matches!(
            engine.admit("k", &rule).await,
            AdmissionDecision::Allowed(RateLimitResult { remaining: 1, .. })
        ));
        assert!(engine.admit("k", &rule).await.is_admitted());

        let denied = engine.admit("k", &rule).await;
        assert!(!denied.is_admitted());
        assert_eq!(
            denied.result(),
            Some(&RateLimitResult {
                allowed: false,
                limit: 2,
                remaining: 0,
                retry_after_seconds: Some(30),
            })
        );

        clock.advance(Duration::from_secs(31));
        assert!(engine.admit("k", &rule).await.is_admitted());

        assert!(engine.local().is_some());
        assert!(engine.circuit_breaker().is_none());
        assert_eq!(engine.failure_mode(), FailureMode::FailOpen);
    });
}

#[test]
fn distributed_engine_passes_clock_time_to_backend() {
    block_on_multi_thread(async {
        let backend = Arc::new(InMemoryBackend::default());
        let (engine, clock) = distributed(
            backend.clone(),
            CircuitBreakerConfig::default(),
            FailureMode::FailOpen,
        );

        clock.advance(Duration::from_millis(1_234));
        let result = engine.evaluate("k", &per_minute(10)).await.unwrap();

        assert!(result.allowed);
        assert_eq!(result.remaining, 9);
        assert_eq!(backend.last_now_ms.load(Ordering::SeqCst), clock.now_millis());
        assert!(engine.local().is_none());
        assert_eq!(engine.cleanup(), 0);
    });
}

#[test]
fn engines_sharing_a_backend_share_one_budget() {
    block_on_multi_thread(async {
        let backend: Arc<dyn AtomicBucketBackend> = Arc::new(InMemoryBackend::default());
        let (first, _) = distributed(
            backend.clone(),
            CircuitBreakerConfig::default(),
            FailureMode::FailOpen,
        );
        let (second, _) = distributed(
            backend,
            CircuitBreakerConfig::default(),
            FailureMode::FailOpen,
        );
        let (first, second) = (Arc::new(first), Arc::new(second));

        let rule = per_minute(10);
        let tasks = (0..20).map(|i| {
            let engine = if i % 2 == 0 { first.clone() } else { second.clone() };
            tokio::spawn(async move { engine.admit("shared", &rule).await })
        });

        let decisions: Vec<AdmissionDecision> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let allowed = decisions
            .iter()
            .filter(|d| matches!(d, AdmissionDecision::Allowed(_)))
            .count();
        let denied = decisions
            .iter()
            .filter(|d| matches!(d, AdmissionDecision::Denied(_)))
            .count();

        assert_eq!(allowed, 10);
        assert_eq!(denied, 10);
    });
}

#[test]
fn single_token_admits_exactly_one_of_five() {
    block_on_multi_thread(async {
        let (engine, _) = distributed(
            Arc::new(InMemoryBackend::default()),
            CircuitBreakerConfig::default(),
            FailureMode::FailClosed,
        );
        let engine = Arc::new(engine);
        let rule = per_minute(1);

        let tasks = (0..5).map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.admit("one", &rule).await.is_admitted() })
        });

        let admitted = join_all(tasks)
            .await
            .into_iter()
            .filter(|joined| *joined.as_ref().unwrap())
            .count();

        assert_eq!(admitted, 1);
    });
}

#[test]
fn fail_open_bypasses_when_backend_fails() {
    block_on_multi_thread(async {
        let (engine, _) = distributed(
            Arc::new(FailingBackend::default()),
            CircuitBreakerConfig::default(),
            FailureMode::FailOpen,
        );

        let err = engine.evaluate("k", &per_minute(10)).await.unwrap_err();
        assert!(err.is_unavailable());

        let decision = engine.admit("k", &per_minute(10)).await;
        assert_eq!(decision, AdmissionDecision::Bypassed);
        assert!(decision.is_admitted());
        assert_eq!(decision.result(), None);
    });
}

#[test]
fn fail_closed_rejects_when_backend_fails() {
    block_on_multi_thread(async {
        let (engine, _) = distributed(
            Arc::new(FailingBackend::default()),
            CircuitBreakerConfig::default(),
            FailureMode::FailClosed,
        );

        let decision = engine.admit("k", &per_minute(10)).await;
        assert_eq!(decision, AdmissionDecision::Failed);
        assert!(!decision.is_admitted());
    });
}

#[test]
fn open_circuit_stops_calling_the_backend() {
    block_on_multi_thread(async {
        let backend = Arc::new(FailingBackend::default());
        let (engine, clock) = distributed(
            backend.clone(),
            CircuitBreakerConfig::default(),
            FailureMode::FailOpen,
        );
        let rule = per_minute(10);

        for _ in 0..5 {
            assert_eq!(engine.admit("k", &rule).await, AdmissionDecision::Bypassed);
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 5);
        assert_eq!(
            engine.circuit_breaker().map(CircuitBreaker::state),
            Some(CircuitState::Open)
        );

        for _ in 0..10 {
            assert!(matches!(
                engine.evaluate("k", &rule).await,
                Err(TokengateError::CircuitOpen { .. })
            ));
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 5);

        // after the break a single trial reaches the backend again
        clock.advance(Duration::from_secs(15));
        assert_eq!(engine.admit("k", &rule).await, AdmissionDecision::Bypassed);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 6);
    });
}

#[test]
fn cancelled_distributed_call_is_a_breaker_failure() {
    block_on_multi_thread(async {
        let config =
            CircuitBreakerConfig::new(1.0, 2, Duration::from_secs(30), Duration::from_secs(15))
                .unwrap();
        let (engine, _) = distributed(Arc::new(HangingBackend), config, FailureMode::FailClosed);
        let rule = per_minute(10);

        for _ in 0..2 {
            let outcome =
                tokio::time::timeout(Duration::from_millis(20), engine.admit("k", &rule)).await;
            assert!(outcome.is_err());
        }

        assert_eq!(
            engine.circuit_breaker().map(CircuitBreaker::state),
            Some(CircuitState::Open)
        );
        assert_eq!(engine.admit("k", &rule).await, AdmissionDecision::Failed);
    });
}
