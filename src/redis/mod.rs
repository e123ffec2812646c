//! Redis-backed distributed backend.
//!
//! State for every key lives in one Redis hash and is mutated only by a Lua script,
//! so any number of processes sharing the server see one consistent bucket per key.
//!
//! Requires the `redis-tokio` feature.

mod common;
pub use common::*;

mod redis_token_bucket;
pub use redis_token_bucket::*;
