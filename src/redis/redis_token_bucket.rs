use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;

use crate::{
    AtomicBucketBackend, RateLimitResult, Rule, TokengateError,
    clock::{Clock, SystemClock},
    redis::{KeyPrefix, RedisConnectionPool},
    token_bucket::{RETRY_AFTER_PRECISION, millis_to_seconds},
};

/// Minimum expiry of a bucket hash, in seconds.
const MIN_TTL_SECONDS: u64 = 600;

/// Revision of [`TOKEN_BUCKET_SCRIPT`]. Bump whenever the script changes so the
/// change shows up next to the Rust evaluator it mirrors.
pub const TOKEN_BUCKET_SCRIPT_VERSION: u32 = 2;

/// Refill, consume and persist one bucket atomically.
///
/// KEYS[1] = bucket hash
/// ARGV    = capacity, refill rate (tokens/s), now (s), ttl (s), rounding precision
/// Returns   {allowed 0|1, remaining, retry after seconds or -1}
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]

local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl_seconds = tonumber(ARGV[4])
local scale = 10 ^ tonumber(ARGV[5])

local state = redis.call("HMGET", key, "tokens", "ts")
local tokens = tonumber(state[1])
local ts = tonumber(state[2])

if tokens == nil or ts == nil then
    tokens = capacity
    ts = now
end

local elapsed = math.max(0, now - ts)
tokens = math.min(tokens + elapsed * refill_rate, capacity)
ts = math.max(now, ts)

local allowed = 0
local remaining = 0
local retry_after = -1

if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
    remaining = math.floor(tokens)
elseif refill_rate > 0 then
    local wait = math.floor((1 - tokens) / refill_rate * scale + 0.5) / scale
    retry_after = math.ceil(wait)
end

redis.call("HSET", key, "tokens", string.format("%.17g", tokens), "ts", string.format("%.17g", ts))
redis.call("EXPIRE", key, ttl_seconds)

return {allowed, remaining, retry_after}
"#;

/// Configuration for [`RedisTokenBucket`].
///
/// # Requirements
///
/// - **Redis version:** >= 4.0 (`HSET` with multiple fields)
/// - **Runtime:** Tokio
///
/// # Examples
///
/// ```ignore
/// use std::time::Duration;
/// use tokengate::redis::{KeyPrefix, RedisConnectionPool, RedisTokenBucketOptions};
///
/// let client = redis::Client::open("redis://127.0.0.1:6379/")?;
/// let pool = RedisConnectionPool::from_client(client, 4).await?;
///
/// let options = RedisTokenBucketOptions {
///     prefix: Some(KeyPrefix::try_from("myapp")?), // keys: myapp:<client key>
///     timeout: Duration::from_millis(100),
///     ..RedisTokenBucketOptions::new(pool)
/// };
/// ```
#[derive(Clone, Debug)]
pub struct RedisTokenBucketOptions {
    /// Connections to Redis.
    pub client: RedisConnectionPool,
    /// Prefix for every key. Defaults to `"tokengate"`.
    pub prefix: Option<KeyPrefix>,
    /// Upper bound on one evaluation round trip. Defaults to 250ms.
    pub timeout: Duration,
    /// Time source for the `now` argument. Defaults to [`SystemClock`].
    ///
    /// Every instance sharing a Redis server should use a synchronized wall clock.
    pub clock: Arc<dyn Clock>,
}

impl RedisTokenBucketOptions {
    /// Options with default prefix, timeout and clock.
    pub fn new(client: RedisConnectionPool) -> Self {
        Self {
            client,
            prefix: None,
            timeout: Duration::from_millis(250),
            clock: Arc::new(SystemClock),
        }
    }
}

/// Token bucket whose state lives in Redis.
///
/// Each evaluation is one script invocation, which Redis runs without interleaving
/// any other command. Every instance pointed at the same server therefore shares a
/// single, race-free bucket per key.
///
/// # Data model
///
/// One hash per key at `<prefix>:<client key>` with fields `tokens` and `ts`
/// (seconds since the Unix epoch), both written as full-precision decimal strings.
/// The hash expires `max(2 × window, 600s)` after the last evaluation.
///
/// # Failure semantics
///
/// - Calls are bounded by [`RedisTokenBucketOptions::timeout`] and are never
///   retried here.
/// - A call that times out or is cancelled before Redis runs the script leaves the
///   bucket untouched. One cancelled after the script was sent may or may not have
///   consumed a token; it is never reported as allowed.
#[derive(Debug)]
pub struct RedisTokenBucket {
    client: RedisConnectionPool,
    script: redis::Script,
    prefix: KeyPrefix,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl RedisTokenBucket {
    /// Create a limiter. No connection is made until the first evaluation.
    pub fn new(options: RedisTokenBucketOptions) -> Self {
        Self {
            client: options.client,
            script: redis::Script::new(TOKEN_BUCKET_SCRIPT),
            prefix: options.prefix.unwrap_or_default(),
            timeout: options.timeout,
            clock: options.clock,
        }
    } // end constructor

    /// Evaluate `rule` for `key` at the configured clock's current time.
    pub async fn evaluate(
        &self,
        key: &str,
        rule: &Rule,
    ) -> Result<RateLimitResult, TokengateError> {
        self.evaluate_at(key, rule, self.clock.now_millis()).await
    }

    /// Evaluate `rule` for `key` at `now_ms` (Unix milliseconds).
    pub async fn evaluate_at(
        &self,
        key: &str,
        rule: &Rule,
        now_ms: u64,
    ) -> Result<RateLimitResult, TokengateError> {
        let redis_key = self.prefix.key_for(key);
        let mut connection_manager = self.client.get();

        let script_call = async {
            let reply: (i64, i64, i64) = self
                .script
                .key(redis_key.as_str())
                .arg(rule.bucket_capacity())
                .arg(rule.refill_rate())
                .arg(millis_to_seconds(now_ms))
                .arg(ttl_seconds(rule))
                .arg(RETRY_AFTER_PRECISION)
                .invoke_async(&mut connection_manager)
                .await?;

            Ok::<_, TokengateError>(reply)
        };

        let reply = tokio::time::timeout(self.timeout, script_call).await;

        let (allowed, remaining, retry_after) = match reply {
            Ok(reply) => reply?,
            Err(_) => {
                tracing::warn!(
                    key = %redis_key,
                    timeout = ?self.timeout,
                    "Redis evaluation timed out"
                );
                return Err(TokengateError::Timeout(self.timeout));
            }
        };

        match allowed {
            1 => Ok(RateLimitResult::allowed(
                rule.limit(),
                u64::try_from(remaining).unwrap_or(0),
            )),
            0 => Ok(RateLimitResult::denied(
                rule.limit(),
                u64::try_from(retry_after).ok(),
            )),
            other => Err(TokengateError::BackendUnavailable(format!(
                "unexpected allowed flag from token bucket script: {other}"
            ))),
        }
    } // end method evaluate_at

    /// Prefix this limiter writes under.
    pub fn prefix(&self) -> &KeyPrefix {
        &self.prefix
    }
}

impl AtomicBucketBackend for RedisTokenBucket {
    fn evaluate<'a>(
        &'a self,
        key: &'a str,
        rule: &'a Rule,
        now_ms: u64,
    ) -> BoxFuture<'a, Result<RateLimitResult, TokengateError>> {
        Box::pin(self.evaluate_at(key, rule, now_ms))
    }
}

/// Expiry for a bucket hash: twice the window, but never under ten minutes.
pub(crate) fn ttl_seconds(rule: &Rule) -> u64 {
    let twice_window = rule.window().as_secs_f64() * 2.0;
    (twice_window as u64).max(MIN_TTL_SECONDS)
}
