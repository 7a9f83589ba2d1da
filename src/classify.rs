//! Maps the outcome of one attempt to success, a retryable failure or a terminal failure.
//!
//! Rules, checked in order:
//!
//! 1. No response (transport failure): retry
//! 2. `429 Too Many Requests`: retry, honouring `Retry-After`
//! 3. `5xx`: retry
//! 4. any other non-`2xx`: stop
//! 5. `2xx`: success
//!
//! Error bodies are parsed as `{code, message}` (optionally wrapped in `{"error": ...}`). When
//! that fails the code is [`UNKNOWN_CODE`] and the message is the raw body.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::backoff;
use crate::error::{Error, Status, Transport, TransportError, UNKNOWN_CODE};
use crate::transport::RawResponse;

/// Why an attempt did not succeed.
#[non_exhaustive]
#[derive(Debug)]
pub enum Failure {
    Status(Status),
    Transport(Transport),
}

impl Failure {
    /// The server supplied retry hint, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Failure::Status(status) => status.retry_after,
            Failure::Transport(_) => None,
        }
    }

    #[must_use]
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Failure::Status(status) => Some(status.status_code),
            Failure::Transport(_) => None,
        }
    }

    /// Records how many attempts the operation had made when this failure was observed.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        match &mut self {
            Failure::Status(status) => status.attempts = attempts,
            Failure::Transport(transport) => transport.attempts = attempts,
        }
        self
    }
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Status(status) => status.into(),
            Failure::Transport(transport) => transport.into(),
        }
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub enum Classification {
    Success(RawResponse),
    Retry(Failure),
    Stop(Failure),
}

/// The bare retry predicate. `None` stands for "no response received".
#[must_use]
pub fn should_retry(status: Option<StatusCode>) -> bool {
    match status {
        None => true,
        Some(status) => status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error(),
    }
}

/// Classifies the outcome of a single attempt at `method path`.
///
/// The returned failure reports a single attempt; the dispatcher overwrites the count with
/// [`Failure::with_attempts`].
#[must_use]
pub fn classify(
    method: &Method,
    path: &str,
    outcome: std::result::Result<RawResponse, TransportError>,
) -> Classification {
    let response = match outcome {
        Ok(response) => response,
        Err(source) => {
            return Classification::Retry(Failure::Transport(Transport {
                method: method.clone(),
                path: path.to_owned(),
                attempts: 1,
                source,
            }));
        }
    };

    if response.status.is_success() {
        return Classification::Success(response);
    }

    let retry_after = if response.status == StatusCode::TOO_MANY_REQUESTS {
        backoff::retry_after(&response.headers)
    } else {
        None
    };
    let (code, message) = parse_error_body(&response.body);

    let failure = Failure::Status(Status {
        status_code: response.status,
        method: method.clone(),
        path: path.to_owned(),
        code,
        message,
        attempts: 1,
        retry_after,
    });

    if should_retry(Some(response.status)) {
        Classification::Retry(failure)
    } else {
        Classification::Stop(failure)
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<Value>,
    message: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorEnvelope {
    Nested { error: ErrorBody },
    Flat(ErrorBody),
}

fn parse_error_body(body: &[u8]) -> (String, String) {
    let parsed = serde_json::from_slice::<ErrorEnvelope>(body).map(|envelope| match envelope {
        ErrorEnvelope::Nested { error } | ErrorEnvelope::Flat(error) => error,
    });

    match parsed {
        Ok(ErrorBody { code, message }) => {
            let code = match code {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(code)) => code,
                Some(other) => other.to_string(),
            };
            (code, message)
        }
        Err(_) => (
            UNKNOWN_CODE.to_owned(),
            String::from_utf8_lossy(body).into_owned(),
        ),
    }
}
