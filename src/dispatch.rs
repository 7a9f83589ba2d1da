//! The authenticated request dispatch pipeline.
//!
//! One [`Operation`] is carried out as a sequence of signed attempts:
//!
//! ```text
//! Building -> Signing -> Sending -> Classifying -+-> Succeeded
//!    ^                                            +-> Failed
//!    +------------------ Retrying <---------------+
//! ```
//!
//! - **Building** resolves the operation against the host into a [`Request`].
//! - **Signing** captures one timestamp from the [`Clock`] and signs with it. Signing failures
//!   fail the operation immediately.
//! - **Sending** hands the request to the [`Transport`].
//! - **Classifying** runs [`classify`]: success, terminal failure, or retryable failure.
//! - **Retrying** sleeps for [`BackoffPolicy::delay`] and goes back to Building, so every
//!   attempt gets a new timestamp and a new signature.
//!
//! When attempts run out the last observed failure is surfaced. A [`CancellationToken`] fired
//! while sending or while backing off fails the operation with [`Cancelled`] and no further
//! attempt is sent.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Body, Method, Request, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::{Signer, path_and_query};
use crate::backoff::BackoffPolicy;
use crate::classify::{Classification, Failure, classify};
use crate::clock::{Clock, SystemClock};
use crate::error::{Cancelled, Error};
use crate::transport::{HttpTransport, Transport};
use crate::{Result, ToQueryParams, serde_helpers};

/// Default cap on attempts per [`Operation`], the first attempt included.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// The caller-visible unit of work: a method, a path (with any query string) relative to the
/// host, and an optional JSON body.
///
/// The body bytes are stored exactly as they will be transmitted and signed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    method: Method,
    path: String,
    body: Option<Vec<u8>>,
}

impl Operation {
    #[must_use]
    pub fn new<P: Into<String>>(method: Method, path: P) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
        }
    }

    #[must_use]
    pub fn get<P: Into<String>>(path: P) -> Self {
        Self::new(Method::GET, path)
    }

    #[must_use]
    pub fn post<P: Into<String>>(path: P) -> Self {
        Self::new(Method::POST, path)
    }

    #[must_use]
    pub fn put<P: Into<String>>(path: P) -> Self {
        Self::new(Method::PUT, path)
    }

    #[must_use]
    pub fn delete<P: Into<String>>(path: P) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Appends `query` to the path, joining onto an existing query string if there is one.
    #[must_use]
    pub fn query<Q: ToQueryParams>(mut self, query: &Q) -> Self {
        let params = query.query_params(None);
        match params.strip_prefix('?') {
            Some(params) if self.path.contains('?') => {
                self.path.push('&');
                self.path.push_str(params);
            }
            _ => self.path.push_str(&params),
        }
        self
    }

    /// Serializes `body` as the JSON payload.
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self> {
        self.body = Some(serde_json::to_vec(body)?);
        Ok(self)
    }

    /// Uses `body` verbatim as the JSON payload.
    #[must_use]
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn payload(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }
}

/// A successful (`2xx`) response.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Attempts it took to obtain this response, at least one
    pub attempts: u32,
}

impl Response {
    /// Deserializes the body. An empty body reads as JSON `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_helpers::from_body(&self.body)
    }
}

/// Signs and sends [`Operation`]s against one host, retrying transient failures.
///
/// The dispatcher is read-only once built. Every call to [`Dispatcher::dispatch`] keeps its own
/// attempt counter, so one dispatcher serves any number of concurrent operations. They share only
/// the [`Signer`] and the transport's connection pool.
#[derive(Debug)]
pub struct Dispatcher<T: Transport = HttpTransport> {
    host: Url,
    signer: Arc<Signer>,
    transport: T,
    policy: BackoffPolicy,
    max_attempts: u32,
    clock: Arc<dyn Clock>,
}

impl<T: Transport> Dispatcher<T> {
    #[must_use]
    pub fn new(host: Url, signer: Arc<Signer>, transport: T) -> Self {
        Self {
            host,
            signer,
            transport,
            policy: BackoffPolicy::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Caps the number of attempts per operation. Values below one are raised to one.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_clock<C: Clock>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    #[must_use]
    pub fn host(&self) -> &Url {
        &self.host
    }

    #[must_use]
    pub fn signer(&self) -> &Arc<Signer> {
        &self.signer
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[must_use]
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Carries out `operation`, returning the first successful response or exactly one error.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(
            name = "dispatch",
            level = "debug",
            skip(self, operation, cancel),
            fields(
                method = %operation.method(),
                path = operation.path(),
                attempts,
                status_code
            )
        )
    )]
    pub async fn dispatch(
        &self,
        operation: &Operation,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let method = operation.method();
        let mut ordinal: u32 = 1;

        loop {
            let sent = ordinal - 1;
            if cancel.is_cancelled() {
                return Err(cancelled(operation, sent));
            }

            // Building
            let mut request = self
                .build(operation)
                .map_err(|e| e.with_attempts(sent))?;
            let path = path_and_query(request.url());

            // Signing: one timestamp for both the signed message and the header
            let timestamp = self.clock.now();
            let headers = self
                .signer
                .create_headers(&request, timestamp)
                .map_err(|e| e.with_attempts(sent))?;
            request.headers_mut().extend(headers);

            #[cfg(feature = "tracing")]
            tracing::debug!(attempt = ordinal, %timestamp, "sending request");

            // Sending
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(cancelled(operation, ordinal)),
                outcome = self.transport.send(request) => outcome,
            };

            // Classifying
            let failure = match classify(method, &path, outcome) {
                Classification::Success(raw) => {
                    #[cfg(feature = "tracing")]
                    {
                        let span = tracing::Span::current();
                        span.record("attempts", ordinal);
                        span.record("status_code", raw.status.as_u16());
                    }

                    return Ok(Response {
                        status: raw.status,
                        headers: raw.headers,
                        body: raw.body,
                        attempts: ordinal,
                    });
                }
                Classification::Stop(failure) => {
                    return Err(failed(failure.with_attempts(ordinal)));
                }
                Classification::Retry(failure) => failure.with_attempts(ordinal),
            };

            if ordinal >= self.max_attempts {
                return Err(failed(failure));
            }

            // Retrying
            let hint = failure.retry_after();
            let delay = self.policy.delay(ordinal, hint);

            #[cfg(feature = "tracing")]
            tracing::warn!(
                attempt = ordinal,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                retry_after = hint.is_some(),
                reason = %Error::from(failure),
                "retrying request"
            );
            #[cfg(not(feature = "tracing"))]
            drop(failure);

            if !backoff(delay, cancel).await {
                return Err(cancelled(operation, ordinal));
            }

            ordinal += 1;
        }
    }

    fn build(&self, operation: &Operation) -> Result<Request> {
        let path = operation.path();
        if !path.starts_with('/') {
            return Err(Error::validation(format!(
                "path `{path}` must start with `/`"
            )));
        }

        let mut base = self.host.clone();
        base.set_query(None);
        base.set_fragment(None);
        let url = Url::parse(&format!("{}{path}", base.as_str().trim_end_matches('/')))?;

        let mut request = Request::new(operation.method().clone(), url);
        if let Some(body) = operation.payload() {
            request
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            *request.body_mut() = Some(Body::from(body.to_vec()));
        }

        Ok(request)
    }
}

/// Sleeps for `delay`. Returns `false` if `cancel` fired first.
async fn backoff(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

fn failed(failure: Failure) -> Error {
    let error = Error::from(failure);

    #[cfg(feature = "tracing")]
    {
        let span = tracing::Span::current();
        if let Some(attempts) = error.attempts() {
            span.record("attempts", attempts);
        }
        if let Some(status_code) = error.status_code() {
            span.record("status_code", status_code.as_u16());
        }
        tracing::warn!(kind = ?error.kind(), error = %error, "request failed");
    }

    error
}

fn cancelled(operation: &Operation, attempts: u32) -> Error {
    #[cfg(feature = "tracing")]
    tracing::debug!(attempts, "request cancelled");

    Cancelled {
        method: operation.method().clone(),
        path: operation.path().to_owned(),
        attempts,
    }
    .into()
}
