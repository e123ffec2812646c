use futures::future::BoxFuture;

use crate::{RateLimitResult, Rule, TokengateError};

/// A shared store that performs refill-and-consume as one indivisible operation.
///
/// Implementations run the token-bucket steps of [`crate::token_bucket::evaluate`]
/// server-side, so concurrent callers in any number of processes are serialized per
/// key by the store itself. No client-side locking is involved.
///
/// Implementations must not retry internally: a retried call could consume a
/// second token for the same logical request.
pub trait AtomicBucketBackend: Send + Sync {
    /// Evaluate `rule` for `key` at `now_ms` (Unix milliseconds).
    fn evaluate<'a>(
        &'a self,
        key: &'a str,
        rule: &'a Rule,
        now_ms: u64,
    ) -> BoxFuture<'a, Result<RateLimitResult, TokengateError>>;
}
