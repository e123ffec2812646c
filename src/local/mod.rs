//! In-process backend.
//!
//! Buckets live in a [`DashMap`](dashmap::DashMap) inside the current process.
//!
//! # Key Characteristics
//!
//! - **Thread-safe:** per-key mutexes, sharded map, no global lock
//! - **No I/O:** evaluation never blocks on the network and cannot fail
//! - **Process-scoped:** state is not shared across processes
//!
//! # When to Use
//!
//! ✅ **Use the local backend when:**
//! - One process owns the limit
//! - Latency matters more than cross-instance accuracy
//!
//! ❌ **Don't use the local backend when:**
//! - Several instances must share one budget per key
//! - Limits must survive process restarts
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use tokengate::{LocalTokenBucket, LocalTokenBucketOptions, Rule};
//!
//! let limiter = LocalTokenBucket::new(LocalTokenBucketOptions {
//!     idle_ttl: Duration::from_secs(300),
//!     ..Default::default()
//! });
//!
//! let rule = Rule::new(100, Duration::from_secs(60)).unwrap();
//! let result = limiter.evaluate("10.0.0.1:/api/resource", &rule);
//! assert!(result.allowed);
//! assert_eq!(result.remaining, 99);
//! ```

mod local_state_store;
pub use local_state_store::*;

mod local_token_bucket;
pub use local_token_bucket::*;
