//! Top-level entrypoint that wires one backend behind a single `evaluate` call.
//!
//! The backend is chosen once, when the [`AdmissionEngine`] is built:
//!
//! - **Local:** [`LocalTokenBucket`], in-process state, cannot fail.
//! - **Distributed:** any [`AtomicBucketBackend`] (normally
//!   [`RedisTokenBucket`](crate::redis::RedisTokenBucket)) guarded by a
//!   [`CircuitBreaker`].
//!
//! [`AdmissionEngine::admit`] is the only place that applies [`FailureMode`].

use std::{
    sync::{Arc, Mutex, PoisonError, Weak, mpsc},
    thread,
    time::Duration,
};

use crate::{
    AtomicBucketBackend, CircuitBreaker, CircuitBreakerConfig, LocalTokenBucket,
    LocalTokenBucketOptions, RateLimitResult, Rule, TokengateError,
    clock::{Clock, SystemClock},
};

#[cfg(feature = "redis-tokio")]
use crate::redis::{RedisTokenBucket, RedisTokenBucketOptions};

/// What [`AdmissionEngine::admit`] does when the backend cannot be reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailureMode {
    /// Let the work through.
    #[default]
    FailOpen,
    /// Refuse the work as a service failure.
    FailClosed,
}

/// Final answer of [`AdmissionEngine::admit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Within the limit.
    Allowed(RateLimitResult),
    /// Over the limit.
    Denied(RateLimitResult),
    /// The backend was unavailable and the engine fails open.
    Bypassed,
    /// The backend was unavailable and the engine fails closed.
    Failed,
}

impl AdmissionDecision {
    /// Whether the unit of work may proceed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Allowed(_) | Self::Bypassed)
    }

    /// The evaluation behind this decision, when one was made.
    pub fn result(&self) -> Option<&RateLimitResult> {
        match self {
            Self::Allowed(result) | Self::Denied(result) => Some(result),
            Self::Bypassed | Self::Failed => None,
        }
    }
}

/// Settings for the distributed pairing.
#[derive(Clone)]
pub struct DistributedOptions {
    /// Shared store running the atomic evaluation.
    pub backend: Arc<dyn AtomicBucketBackend>,
    /// Breaker guarding calls to `backend`.
    pub circuit_breaker: CircuitBreaker,
    /// Time source for the `now` handed to the backend.
    pub clock: Arc<dyn Clock>,
}

impl DistributedOptions {
    /// Default breaker settings and the system clock.
    pub fn new(backend: Arc<dyn AtomicBucketBackend>) -> Self {
        Self {
            backend,
            circuit_breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
            clock: Arc::new(SystemClock),
        }
    }
}

/// Backend selection for [`AdmissionEngine::new`].
#[derive(Clone)]
pub enum BackendOptions {
    /// In-process buckets.
    Local(LocalTokenBucketOptions),
    /// Shared buckets behind a circuit breaker.
    Distributed(DistributedOptions),
}

/// Top-level configuration for [`AdmissionEngine`].
#[derive(Clone)]
pub struct AdmissionEngineOptions {
    /// Which backend pairing to build.
    pub backend: BackendOptions,
    /// Applied by [`AdmissionEngine::admit`] when evaluation fails.
    pub failure_mode: FailureMode,
    /// Period of [`AdmissionEngine::run_cleanup_loop`]. Defaults to 5 minutes.
    pub cleanup_interval: Duration,
}

impl AdmissionEngineOptions {
    /// Options for `backend` with fail-open and the default cleanup interval.
    pub fn new(backend: BackendOptions) -> Self {
        Self {
            backend,
            failure_mode: FailureMode::default(),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

enum Backend {
    Local(LocalTokenBucket),
    Distributed(DistributedOptions),
}

/// Admission-control engine.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tokengate::{
///     AdmissionDecision, AdmissionEngine, AdmissionEngineOptions, BackendOptions,
///     LocalTokenBucketOptions, Rule,
/// };
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let engine = AdmissionEngine::new(AdmissionEngineOptions::new(BackendOptions::Local(
///     LocalTokenBucketOptions::default(),
/// )));
///
/// let rule = Rule::new(10, Duration::from_secs(60)).unwrap();
///
/// match engine.admit("10.0.0.1:/api/resource", &rule).await {
///     AdmissionDecision::Allowed(result) => assert_eq!(result.remaining, 9),
///     other => panic!("unexpected decision: {other:?}"),
/// }
/// # });
/// ```
pub struct AdmissionEngine {
    backend: Backend,
    failure_mode: FailureMode,
    cleanup_interval: Duration,
    cleanup_stop: Mutex<Option<mpsc::Sender<()>>>,
}

impl AdmissionEngine {
    /// Build the engine and its backend.
    pub fn new(options: AdmissionEngineOptions) -> Self {
        let backend = match options.backend {
            BackendOptions::Local(local) => Backend::Local(LocalTokenBucket::new(local)),
            BackendOptions::Distributed(distributed) => Backend::Distributed(distributed),
        };

        Self {
            backend,
            failure_mode: options.failure_mode,
            cleanup_interval: options.cleanup_interval,
            cleanup_stop: Mutex::new(None),
        }
    } // end constructor

    /// Engine over a [`RedisTokenBucket`] guarded by `circuit_breaker`.
    ///
    /// The breaker is given the Redis options' clock.
    #[cfg(feature = "redis-tokio")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-tokio")))]
    pub fn redis(
        redis: RedisTokenBucketOptions,
        circuit_breaker: CircuitBreakerConfig,
        failure_mode: FailureMode,
    ) -> Self {
        let clock = redis.clock.clone();
        let backend: Arc<dyn AtomicBucketBackend> = Arc::new(RedisTokenBucket::new(redis));

        Self::new(AdmissionEngineOptions {
            failure_mode,
            ..AdmissionEngineOptions::new(BackendOptions::Distributed(DistributedOptions {
                backend,
                circuit_breaker: CircuitBreaker::new(circuit_breaker).with_clock(clock.clone()),
                clock,
            }))
        })
    }

    /// Evaluate `rule` for `key` against the configured backend.
    ///
    /// # Errors
    ///
    /// Only the distributed backend fails, with one of the unavailable variants of
    /// [`TokengateError`] (timeout, Redis error, open circuit). Nothing is retried.
    pub async fn evaluate(&self, key: &str, rule: &Rule) -> Result<RateLimitResult, TokengateError> {
        match &self.backend {
            Backend::Local(limiter) => Ok(limiter.evaluate(key, rule)),
            Backend::Distributed(distributed) => {
                let now_ms = distributed.clock.now_millis();

                distributed
                    .circuit_breaker
                    .call(|| distributed.backend.evaluate(key, rule, now_ms))
                    .await
            }
        }
    } // end method evaluate

    /// Evaluate and turn the outcome into a final decision, applying the
    /// configured [`FailureMode`] when evaluation fails.
    pub async fn admit(&self, key: &str, rule: &Rule) -> AdmissionDecision {
        match self.evaluate(key, rule).await {
            Ok(result) if result.allowed => {
                tracing::debug!(key = %key, remaining = result.remaining, "Request allowed");
                AdmissionDecision::Allowed(result)
            }
            Ok(result) => {
                tracing::info!(
                    key = %key,
                    retry_after_seconds = ?result.retry_after_seconds,
                    "Request blocked"
                );
                AdmissionDecision::Denied(result)
            }
            Err(err) => {
                tracing::warn!(
                    key = %key,
                    error = %err,
                    failure_mode = ?self.failure_mode,
                    "Rate limit evaluation failed"
                );
                match self.failure_mode {
                    FailureMode::FailOpen => AdmissionDecision::Bypassed,
                    FailureMode::FailClosed => AdmissionDecision::Failed,
                }
            }
        }
    } // end method admit

    /// The configured failure mode.
    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    /// The local limiter, when the engine was built with the local backend.
    pub fn local(&self) -> Option<&LocalTokenBucket> {
        match &self.backend {
            Backend::Local(limiter) => Some(limiter),
            Backend::Distributed(_) => None,
        }
    }

    /// The circuit breaker, when the engine was built with the distributed backend.
    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        match &self.backend {
            Backend::Local(_) => None,
            Backend::Distributed(distributed) => Some(&distributed.circuit_breaker),
        }
    }

    /// Run one idle-eviction sweep and return the number of buckets removed.
    ///
    /// Distributed buckets expire inside Redis, so this is a no-op for them.
    pub fn cleanup(&self) -> usize {
        match &self.backend {
            Backend::Local(limiter) => limiter.cleanup(),
            Backend::Distributed(_) => 0,
        }
    }

    /// Start a background thread calling [`cleanup`](Self::cleanup) every
    /// `cleanup_interval`.
    ///
    /// Calling this while a loop is already running does nothing. The thread holds
    /// only a weak reference and exits once the engine is dropped.
    pub fn run_cleanup_loop(self: &Arc<Self>) {
        self.run_cleanup_loop_with_config(self.cleanup_interval);
    }

    /// Like [`run_cleanup_loop`](Self::run_cleanup_loop) with an explicit interval.
    pub fn run_cleanup_loop_with_config(self: &Arc<Self>, interval: Duration) {
        let mut cleanup_stop = self
            .cleanup_stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if cleanup_stop.is_some() {
            return;
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let engine: Weak<Self> = Arc::downgrade(self);

        let spawned = thread::Builder::new()
            .name("tokengate-cleanup".to_string())
            .spawn(move || {
                // A stop request drops the sender, which ends the wait early.
                while let Err(mpsc::RecvTimeoutError::Timeout) = stop_rx.recv_timeout(interval) {
                    let Some(engine) = engine.upgrade() else {
                        break;
                    };

                    engine.cleanup();
                }

                tracing::debug!("Cleanup loop stopped");
            });

        match spawned {
            Ok(_) => *cleanup_stop = Some(stop_tx),
            Err(err) => tracing::error!(error = ?err, "Failed to spawn cleanup loop"),
        }
    } // end method run_cleanup_loop_with_config

    /// Stop the cleanup loop. Safe to call when none is running.
    pub fn stop_cleanup_loop(&self) {
        self.cleanup_stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
} // end of impl
