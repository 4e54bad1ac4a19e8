//! Shared test infrastructure for `pipeline-core`'s integration tests.
//!
//! Trimmed from the wider monorepo's `test-utils` crate down to the one
//! backend this workspace touches: `TestRedis`, a testcontainers-backed
//! Redis instance for exercising the store client's TTL and
//! connection-discipline behavior against a real server.

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;
