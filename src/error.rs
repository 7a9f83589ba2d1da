use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

/// HTTP method type, re-exported for use with error inspection.
pub use reqwest::Method;
/// HTTP status code type, re-exported for use with error inspection.
pub use reqwest::StatusCode;
use reqwest::header;

/// Boxed error produced by a [`crate::transport::Transport`] when no response was received.
pub type TransportError = Box<dyn StdError + Send + Sync + 'static>;

/// Error code used when an error body could not be parsed into `{code, message}`.
pub const UNKNOWN_CODE: &str = "unknown";

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Missing or malformed identity or client configuration, raised at construction time
    Configuration,
    /// The private key failed to produce a signature. Never retried
    Signing,
    /// No response was received from the exchange after all attempts
    Transport,
    /// The exchange answered `429 Too Many Requests` on the last attempt
    RateLimit,
    /// The exchange answered with a `5xx` status on the last attempt
    Server,
    /// The exchange rejected the request with a non-retryable status
    Client,
    /// The caller cancelled the operation
    Cancellation,
    /// Error related to invalid input supplied to exchange-transport
    Validation,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    attempts: Option<u32>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            attempts: None,
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    /// Whether this error would have been retried had attempts remained.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, Kind::Transport | Kind::RateLimit | Kind::Server)
    }

    /// The HTTP status the exchange answered with, if any response was received.
    #[must_use]
    pub fn status_code(&self) -> Option<StatusCode> {
        self.downcast_ref::<Status>().map(|s| s.status_code)
    }

    /// How many attempts the operation made before surfacing this error.
    #[must_use]
    pub fn attempts(&self) -> Option<u32> {
        if let Some(status) = self.downcast_ref::<Status>() {
            return Some(status.attempts);
        }
        if let Some(transport) = self.downcast_ref::<Transport>() {
            return Some(transport.attempts);
        }
        if let Some(cancelled) = self.downcast_ref::<Cancelled>() {
            return Some(cancelled.attempts);
        }
        self.attempts
    }

    /// Records how many requests went out before a failure that has no attempt count of its
    /// own, such as a signing or validation error raised while preparing the next attempt.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Configuration {
            reason: message.into(),
        }
        .into()
    }

    pub fn signing<S: StdError + Send + Sync + 'static>(source: S) -> Self {
        Error::with_source(Kind::Signing, source)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// A non-successful response from the exchange.
///
/// `code` and `message` come from the exchange's `{code, message}` error body. When the body
/// cannot be parsed, `code` is [`UNKNOWN_CODE`] and `message` carries the raw body.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Status {
    pub status_code: StatusCode,
    pub method: Method,
    pub path: String,
    pub code: String,
    pub message: String,
    /// Attempts made by the operation, including the one that produced this status
    pub attempts: u32,
    /// The server supplied `Retry-After` hint, only present on `429` responses
    pub retry_after: Option<Duration>,
}

impl Status {
    /// The [`Kind`] this status surfaces as.
    #[must_use]
    pub fn kind(&self) -> Kind {
        if self.status_code == StatusCode::TOO_MANY_REQUESTS {
            Kind::RateLimit
        } else if self.status_code.is_server_error() {
            Kind::Server
        } else {
            Kind::Client
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error({}) making {} call to {} after {} attempt(s): [{}] {}",
            self.status_code, self.method, self.path, self.attempts, self.code, self.message
        )
    }
}

impl StdError for Status {}

/// The request never produced a response (connection refused, reset, timed out, ...).
#[non_exhaustive]
#[derive(Debug)]
pub struct Transport {
    pub method: Method,
    pub path: String,
    pub attempts: u32,
    pub source: TransportError,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transport failure making {} call to {} after {} attempt(s): {}",
            self.method, self.path, self.attempts, self.source
        )
    }
}

impl StdError for Transport {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Cancelled {
    pub method: Method,
    pub path: String,
    /// Attempts sent before cancellation was observed
    pub attempts: u32,
}

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} call to {} cancelled after {} attempt(s)",
            self.method, self.path, self.attempts
        )
    }
}

impl StdError for Cancelled {}

#[non_exhaustive]
#[derive(Debug)]
pub struct Configuration {
    pub reason: String,
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "misconfigured: {}", self.reason)
    }
}

impl StdError for Configuration {}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

impl From<Status> for Error {
    fn from(err: Status) -> Self {
        Error::with_source(err.kind(), err)
    }
}

impl From<Transport> for Error {
    fn from(err: Transport) -> Self {
        Error::with_source(Kind::Transport, err)
    }
}

impl From<Cancelled> for Error {
    fn from(err: Cancelled) -> Self {
        Error::with_source(Kind::Cancellation, err)
    }
}

impl From<Configuration> for Error {
    fn from(err: Configuration) -> Self {
        Error::with_source(Kind::Configuration, err)
    }
}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<rsa::signature::Error> for Error {
    fn from(e: rsa::signature::Error) -> Self {
        Error::signing(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<header::InvalidHeaderValue> for Error {
    fn from(e: header::InvalidHeaderValue) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> Status {
        Status {
            status_code: StatusCode::from_u16(code).expect("valid status"),
            method: Method::GET,
            path: "/portfolio/orders".to_owned(),
            code: "not_found".to_owned(),
            message: "order not found".to_owned(),
            attempts: 1,
            retry_after: None,
        }
    }

    #[test]
    fn status_kind_follows_status_code() {
        assert_eq!(status(429).kind(), Kind::RateLimit);
        assert_eq!(status(500).kind(), Kind::Server);
        assert_eq!(status(503).kind(), Kind::Server);
        assert_eq!(status(400).kind(), Kind::Client);
        assert_eq!(status(404).kind(), Kind::Client);
    }

    #[test]
    fn status_display_should_succeed() {
        assert_eq!(
            status(404).to_string(),
            "error(404 Not Found) making GET call to /portfolio/orders after 1 attempt(s): [not_found] order not found"
        );
    }

    #[test]
    fn status_into_error_keeps_fields() {
        let mut inner = status(503);
        inner.attempts = 3;
        let error: Error = inner.into();

        assert_eq!(error.kind(), Kind::Server);
        assert!(error.is_retryable(), "5xx should be retryable");
        assert_eq!(error.status_code(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(error.attempts(), Some(3));

        let status = error.downcast_ref::<Status>().expect("status source");
        assert_eq!(status.code, "not_found");
    }

    #[test]
    fn cancelled_into_error_should_succeed() {
        let error: Error = Cancelled {
            method: Method::DELETE,
            path: "/portfolio/orders/1".to_owned(),
            attempts: 1,
        }
        .into();

        assert_eq!(error.kind(), Kind::Cancellation);
        assert!(!error.is_retryable(), "cancellation is terminal");
        assert_eq!(error.attempts(), Some(1));
        assert_eq!(error.status_code(), None);
    }

    #[test]
    fn with_attempts_fills_in_missing_count() {
        let error = Error::validation("path `orders` must start with `/`");
        assert_eq!(error.attempts(), None);

        let error = error.with_attempts(2);
        assert_eq!(error.kind(), Kind::Validation);
        assert_eq!(error.attempts(), Some(2));

        let error = Error::from(status(404)).with_attempts(7);
        assert_eq!(error.attempts(), Some(1), "typed sources keep their own count");
    }

    #[test]
    fn configuration_display_should_succeed() {
        let error = Error::configuration("key id is missing");

        assert_eq!(error.kind(), Kind::Configuration);
        assert_eq!(
            error.to_string(),
            "Configuration: misconfigured: key id is missing"
        );
    }
}
