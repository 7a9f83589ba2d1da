//! The network seam of the dispatcher.
//!
//! A [`Transport`] sends one fully built and signed [`Request`] and hands back whatever came
//! back on the wire. It does not interpret status codes; that is the classifier's job.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::redirect::Policy;
use reqwest::{Client as ReqwestClient, ClientBuilder, Request, StatusCode};

use crate::error::TransportError;

/// A response as received, before classification.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RawResponse {
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }
}

/// Sends a single request.
///
/// Implementations must be safe to share across concurrent operations. An `Err` means no
/// response was received at all (connection refused, reset, timed out, unreadable body).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: Request) -> std::result::Result<RawResponse, TransportError>;
}

/// [`Transport`] over a pooled [`reqwest::Client`].
///
/// Redirects must not be followed: the signature covers the original path, and reqwest would
/// replay the signed headers to the new location (turning a `POST` into a `GET` on `303`).
/// Clients passed to [`HttpTransport::new`] should come from [`HttpTransport::client_builder`].
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: ReqwestClient,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(
            Self::client_builder()
                .build()
                .expect("HTTP client with default settings should build"),
        )
    }
}

impl HttpTransport {
    #[must_use]
    pub fn new(client: ReqwestClient) -> Self {
        Self { client }
    }

    /// A [`reqwest::ClientBuilder`] that surfaces `3xx` responses instead of following them.
    #[must_use]
    pub fn client_builder() -> ClientBuilder {
        ReqwestClient::builder().redirect(Policy::none())
    }

    #[must_use]
    pub fn client(&self) -> &ReqwestClient {
        &self.client
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: Request) -> std::result::Result<RawResponse, TransportError> {
        let response = self.client.execute(request).await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        Ok(RawResponse::new(status, headers, body))
    }
}
