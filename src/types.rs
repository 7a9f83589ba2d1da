//! Re-exported types from external crates for convenience.
//!
//! These types appear in this crate's public API and are re-exported here
//! so users don't need to add these dependencies to their `Cargo.toml`.

/// Date and time types for request timestamps.
pub use chrono::{DateTime, Utc};
/// HTTP method and status types used by [`crate::dispatch::Operation`] and errors.
pub use reqwest::{Method, StatusCode};
/// Cooperative cancellation for in-flight operations.
pub use tokio_util::sync::CancellationToken;
/// Parsed host URLs.
pub use url::Url;
