#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod clock;

pub mod token_bucket;

pub mod local;
pub use local::{LocalStateStore, LocalTokenBucket, LocalTokenBucketOptions};

#[cfg(feature = "redis-tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-tokio")))]
pub mod redis;

mod error;
pub use error::*;

mod common;
pub use common::{RateLimitResult, Rule, RuleOptions};

mod backend;
pub use backend::*;

mod circuit_breaker;
pub use circuit_breaker::*;

mod admission_engine;
pub use admission_engine::*;

#[cfg(test)]
mod tests;
