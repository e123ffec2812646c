use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use crate::{
    LocalStateStore, RateLimitResult, Rule,
    clock::{Clock, SystemClock},
    token_bucket::{self, BucketState},
};

/// Configuration for [`LocalTokenBucket`].
#[derive(Clone, Debug)]
pub struct LocalTokenBucketOptions {
    /// Buckets not evaluated for this long are dropped by the cleanup sweep.
    ///
    /// Defaults to 10 minutes.
    pub idle_ttl: Duration,
    /// Time source. Defaults to [`SystemClock`].
    pub clock: Arc<dyn Clock>,
}

impl Default for LocalTokenBucketOptions {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(600),
            clock: Arc::new(SystemClock),
        }
    }
}

/// In-process token bucket limiter.
///
/// Keeps one [`BucketState`] per key in a [`LocalStateStore`]. Each state sits
/// behind its own mutex, so evaluations for one key run one at a time while
/// different keys never contend.
///
/// # Semantics
///
/// - **No double spend:** N concurrent evaluations against a bucket holding K whole
///   tokens allow exactly K of them.
/// - **Rules are applied per call:** the rule passed to [`evaluate`](Self::evaluate)
///   is the one used for that call. A new key starts at the capacity of the first
///   rule it is evaluated with.
/// - **Process-scoped:** state is not shared with other processes; use the Redis
///   backend for that.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tokengate::{LocalTokenBucket, LocalTokenBucketOptions, Rule};
///
/// let limiter = LocalTokenBucket::new(LocalTokenBucketOptions::default());
/// let rule = Rule::new(2, Duration::from_secs(1)).unwrap();
///
/// assert!(limiter.evaluate("user_123", &rule).allowed);
/// assert!(limiter.evaluate("user_123", &rule).allowed);
/// assert!(!limiter.evaluate("user_123", &rule).allowed);
/// ```
#[derive(Debug)]
pub struct LocalTokenBucket {
    store: LocalStateStore<Mutex<BucketState>>,
    clock: Arc<dyn Clock>,
}

impl LocalTokenBucket {
    /// Create a limiter with an empty store.
    pub fn new(options: LocalTokenBucketOptions) -> Self {
        Self {
            store: LocalStateStore::new(options.idle_ttl, options.clock.clone()),
            clock: options.clock,
        }
    } // end constructor

    pub(crate) fn store(&self) -> &LocalStateStore<Mutex<BucketState>> {
        &self.store
    }

    /// Refill the bucket for `key`, try to take one token, and report the outcome.
    pub fn evaluate(&self, key: &str, rule: &Rule) -> RateLimitResult {
        let bucket = self.store.get_or_create(key, || {
            Mutex::new(BucketState::full(rule, self.clock.now_millis()))
        });

        // A panic while holding the lock cannot leave the state half-written: the
        // new state is computed first and stored with one assignment.
        let mut state = bucket.lock().unwrap_or_else(PoisonError::into_inner);

        // read under the lock so committed timestamps only move forward
        let now_ms = self.clock.now_millis();
        let (next, result) = token_bucket::evaluate(*state, rule, now_ms);
        *state = next;

        result
    } // end method evaluate

    /// Drop buckets idle for longer than the configured TTL.
    pub fn cleanup(&self) -> usize {
        self.store.evict_idle(self.clock.now_millis())
    }
} // end of impl
