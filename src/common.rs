use std::time::Duration;

use crate::TokengateError;

/// Raw, unvalidated rule settings, as they would come out of a configuration file.
///
/// Convert with [`Rule::try_from`].
#[derive(Clone, Debug, PartialEq)]
pub struct RuleOptions {
    /// Requests allowed per window.
    pub limit: u64,
    /// Window the limit applies to. Must be greater than zero.
    pub window: Duration,
    /// Bucket size. Defaults to `limit`.
    pub bucket_capacity: Option<u64>,
    /// Tokens added per second. Defaults to `limit / window`.
    pub refill_rate: Option<f64>,
}

/// A validated token-bucket rule.
///
/// Capacity and refill rate are resolved once, at construction, so the
/// evaluators never see defaults or invalid values.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tokengate::Rule;
///
/// // 10 requests per minute: capacity 10, refill 1/6 token per second.
/// let rule = Rule::new(10, Duration::from_secs(60)).unwrap();
/// assert_eq!(rule.bucket_capacity(), 10);
/// assert_eq!(rule.refill_rate(), 10.0 / 60.0);
///
/// // Bursty variant: 20 tokens up front, same sustained rate.
/// let burst = rule.with_bucket_capacity(20);
/// assert_eq!(burst.bucket_capacity(), 20);
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rule {
    limit: u64,
    window: Duration,
    bucket_capacity: u64,
    refill_rate: f64,
}

impl Rule {
    /// Rule allowing `limit` requests per `window`, with default capacity and refill rate.
    pub fn new(limit: u64, window: Duration) -> Result<Self, TokengateError> {
        if window.is_zero() {
            return Err(TokengateError::InvalidRule(
                "Window must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            limit,
            window,
            bucket_capacity: limit,
            refill_rate: limit as f64 / window.as_secs_f64(),
        })
    }

    /// Override the bucket capacity.
    pub fn with_bucket_capacity(mut self, bucket_capacity: u64) -> Self {
        self.bucket_capacity = bucket_capacity;
        self
    }

    /// Override the refill rate, in tokens per second.
    pub fn with_refill_rate(mut self, refill_rate: f64) -> Result<Self, TokengateError> {
        if !refill_rate.is_finite() {
            return Err(TokengateError::InvalidRule(
                "Refill rate must be a finite number".to_string(),
            ));
        }
        if refill_rate < 0.0 {
            return Err(TokengateError::InvalidRule(
                "Refill rate must not be negative".to_string(),
            ));
        }

        // -0.0 passes the check above; store it as 0.0
        self.refill_rate = if refill_rate == 0.0 { 0.0 } else { refill_rate };
        Ok(self)
    }

    /// Requests allowed per window, reported back in every result.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Window the limit applies to.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Maximum number of tokens the bucket can hold.
    pub fn bucket_capacity(&self) -> u64 {
        self.bucket_capacity
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

impl TryFrom<RuleOptions> for Rule {
    type Error = TokengateError;

    fn try_from(options: RuleOptions) -> Result<Self, Self::Error> {
        let mut rule = Rule::new(options.limit, options.window)?;

        if let Some(bucket_capacity) = options.bucket_capacity {
            rule = rule.with_bucket_capacity(bucket_capacity);
        }
        if let Some(refill_rate) = options.refill_rate {
            rule = rule.with_refill_rate(refill_rate)?;
        }

        Ok(rule)
    }
}

/// Outcome of a single evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Whether the unit of work may proceed.
    pub allowed: bool,
    /// The rule's configured limit.
    pub limit: u64,
    /// Whole tokens left after this evaluation. Always 0 when denied.
    pub remaining: u64,
    /// Seconds until a token becomes available.
    ///
    /// Present if and only if the request was denied and the rule refills.
    pub retry_after_seconds: Option<u64>,
}

impl RateLimitResult {
    pub(crate) fn allowed(limit: u64, remaining: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            retry_after_seconds: None,
        }
    }

    pub(crate) fn denied(limit: u64, retry_after_seconds: Option<u64>) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            retry_after_seconds,
        }
    }
}
