#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod auth;
pub mod backoff;
pub mod classify;
pub mod client;
pub mod clock;
pub mod dispatch;
pub mod error;
pub(crate) mod serde_helpers;
pub mod transport;
pub mod types;

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable holding the exchange API key id, read by [`auth::Identity::from_env`].
pub const KEY_ID_VAR: &str = "EXCHANGE_API_KEY_ID";

/// Environment variable holding the PEM encoded RSA private key, read by
/// [`auth::Identity::from_env`].
pub const PRIVATE_KEY_VAR: &str = "EXCHANGE_PRIVATE_KEY";

/// UTC instant captured once per attempt and shared by the signed message and the timestamp
/// header.
pub type Timestamp = DateTime<Utc>;

/// Trait for converting request types to URL query parameters.
///
/// This trait is automatically implemented for all types that implement [`Serialize`].
/// It uses [`serde_html_form`] to serialize the struct fields into a query string.
/// Arrays are serialized as repeated keys (`key=val1&key=val2`).
pub trait ToQueryParams: Serialize {
    /// Converts the request to a URL query string.
    ///
    /// Returns an empty string if no parameters are set, otherwise returns
    /// a string starting with `?` followed by URL-encoded key-value pairs.
    /// Also uses an optional cursor as a parameter, if provided.
    fn query_params(&self, cursor: Option<&str>) -> String {
        let mut params = serde_html_form::to_string(self)
            .inspect_err(|e| {
                #[cfg(feature = "tracing")]
                tracing::error!("Unable to convert to URL-encoded string {e:?}");
                #[cfg(not(feature = "tracing"))]
                let _: &serde_html_form::ser::Error = e;
            })
            .unwrap_or_default();

        if let Some(cursor) = cursor {
            if !params.is_empty() {
                params.push('&');
            }
            let _ = write!(params, "cursor={cursor}");
        }

        if params.is_empty() {
            String::new()
        } else {
            format!("?{params}")
        }
    }
}

impl<T: Serialize> ToQueryParams for T {}
