use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::Signer;
use crate::backoff::BackoffPolicy;
use crate::dispatch::{DEFAULT_MAX_ATTEMPTS, Dispatcher, Operation};
use crate::error::Error;
use crate::transport::{HttpTransport, Transport};
use crate::{Result, ToQueryParams};

const DEFAULT_USER_AGENT: &str = concat!("exchange-transport/", env!("CARGO_PKG_VERSION"));

/// Configuration for [`Client`]
#[non_exhaustive]
#[derive(Clone, Debug, Builder)]
pub struct Config {
    /// Cap on attempts per operation, the first attempt included. Must be at least one.
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,
    /// Delay after the first failed attempt. The default is 100 milliseconds.
    #[builder(default = Duration::from_millis(100))]
    base_delay: Duration,
    /// Growth factor between consecutive delays. The default is 2.0.
    #[builder(default = 2.0)]
    backoff_multiplier: f64,
    /// Ceiling for computed delays. Server `Retry-After` hints are not clamped. The default is
    /// ten (10) seconds.
    #[builder(default = Duration::from_secs(10))]
    max_delay: Duration,
    /// Per-attempt timeout applied by the HTTP client. A timed out attempt is a transport failure.
    timeout: Option<Duration>,
    #[builder(into)]
    user_agent: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config::builder().build()
    }
}

impl Config {
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[must_use]
    pub fn user_agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT)
    }

    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.base_delay, self.backoff_multiplier, self.max_delay)
    }
}

/// Authenticated client for one exchange host.
///
/// Every call signs its own request, retries transient failures per [`Config`] and deserializes
/// the successful body. Cloning is cheap and clones share the signer and the connection pool.
#[derive(Debug)]
pub struct Client<T: Transport = HttpTransport> {
    inner: Arc<Dispatcher<T>>,
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Client<HttpTransport> {
    /// Creates a client for `host` over a pooled [`reqwest::Client`].
    ///
    /// `host` may carry a base path such as `https://api.exchange.test/trade-api/v2`. Operation
    /// paths are appended to it.
    pub fn new(host: &str, signer: Signer, config: Config) -> Result<Self> {
        let mut headers = HeaderMap::new();

        headers.insert(USER_AGENT, HeaderValue::from_str(config.user_agent())?);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let mut builder = HttpTransport::client_builder().default_headers(headers);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        let transport = HttpTransport::new(builder.build()?);

        Self::with_transport(host, signer, config, transport)
    }
}

impl<T: Transport> Client<T> {
    /// Creates a client that sends through `transport`.
    pub fn with_transport(host: &str, signer: Signer, config: Config, transport: T) -> Result<Self> {
        if config.max_attempts == 0 {
            return Err(Error::configuration("max_attempts must be at least 1"));
        }

        let host = Url::parse(host)
            .map_err(|e| Error::configuration(format!("invalid host `{host}`: {e}")))?;
        if host.cannot_be_a_base() {
            return Err(Error::configuration(format!(
                "host `{host}` cannot be used as a base URL"
            )));
        }
        if host.query().is_some() || host.fragment().is_some() {
            return Err(Error::configuration(format!(
                "host `{host}` must not carry a query or fragment"
            )));
        }

        let dispatcher = Dispatcher::new(host, Arc::new(signer), transport)
            .with_policy(config.backoff_policy())
            .with_max_attempts(config.max_attempts);

        Ok(Self::from_dispatcher(dispatcher))
    }

    /// Wraps an already assembled [`Dispatcher`], e.g. one with a custom [`crate::clock::Clock`].
    #[must_use]
    pub fn from_dispatcher(dispatcher: Dispatcher<T>) -> Self {
        Self {
            inner: Arc::new(dispatcher),
        }
    }

    #[must_use]
    pub fn host(&self) -> &Url {
        self.inner.host()
    }

    #[must_use]
    pub fn key_id(&self) -> &str {
        self.inner.signer().key_id()
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher<T> {
        &self.inner
    }

    pub async fn get<R: DeserializeOwned, Q: ToQueryParams>(
        &self,
        path: &str,
        query: &Q,
    ) -> Result<R> {
        self.request(Operation::get(path).query(query)).await
    }

    pub async fn post<R: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        self.request(Operation::post(path).json(body)?).await
    }

    pub async fn put<R: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        self.request(Operation::put(path).json(body)?).await
    }

    pub async fn delete<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        self.request(Operation::delete(path)).await
    }

    pub async fn request<R: DeserializeOwned>(&self, operation: Operation) -> Result<R> {
        self.request_with_cancellation(operation, &CancellationToken::new())
            .await
    }

    /// Like [`Client::request`], but gives up as soon as `cancel` fires.
    pub async fn request_with_cancellation<R: DeserializeOwned>(
        &self,
        operation: Operation,
        cancel: &CancellationToken,
    ) -> Result<R> {
        self.inner.dispatch(&operation, cancel).await?.json()
    }
}
