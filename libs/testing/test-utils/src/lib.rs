//! Shared test utilities for integration tests
//!
//! - `TestDatabase`: PostgreSQL container with automatic cleanup (feature: "postgres")
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `unique_name`: collision-free stream/table names (always available)
//!
//! # Features
//!
//! - `postgres` (default): Enables PostgreSQL test infrastructure
//! - `redis`: Enables Redis test infrastructure
//! - `all`: Enables all test infrastructure
//!
//! # Usage
//!
//! Add the features you need to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis", "postgres"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::{TestRedis, unique_name};
//!
//! #[tokio::test]
//! async fn my_queue_test() {
//!     let redis = TestRedis::new().await;
//!     let manager = redis.connection_manager().await;
//!     let stream = unique_name("jobs");
//! }
//! ```

use uuid::Uuid;

// Conditionally compile container modules based on features
#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "redis")]
mod redis;

// Re-export based on enabled features
#[cfg(feature = "postgres")]
pub use postgres::TestDatabase;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Unique name for a per-test stream, group or key
///
/// # Example
///
/// ```
/// use test_utils::unique_name;
///
/// let stream = unique_name("jobs");
/// assert!(stream.starts_with("test:jobs:"));
/// ```
pub fn unique_name(prefix: &str) -> String {
    format!("test:{}:{}", prefix, Uuid::now_v7().simple())
}
