#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every fixture"
)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{TimeZone as _, Utc};
use exchange_transport::Timestamp;
use exchange_transport::auth::{Padding, SecretString, Signer, format_timestamp};
use exchange_transport::client::{Client, Config};
use exchange_transport::clock::Clock;
use exchange_transport::dispatch::Dispatcher;
use exchange_transport::transport::HttpTransport;
use exchange_transport::types::Url;
use httpmock::MockServer;

// test-only key, see tests/fixtures
pub const PRIVATE_KEY: &str = include_str!("../fixtures/test_key.pem");
pub const KEY_ID: &str = "a952bcbe-ec3b-4b5b-b8f9-11dae589608c";

/// Base path every test client is rooted at.
pub const BASE_PATH: &str = "/trade-api/v2";

#[must_use]
pub fn start() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).single().unwrap()
}

/// Header value of the timestamp read on attempt `ordinal` (1-based) from a [`SteppingClock`].
#[must_use]
pub fn timestamp(ordinal: i64) -> String {
    format_timestamp(start() + chrono::Duration::seconds(ordinal - 1))
}

/// Starts at [`start`] and advances one second every time it is read.
#[derive(Debug, Default)]
pub struct SteppingClock(AtomicI64);

impl Clock for SteppingClock {
    fn now(&self) -> Timestamp {
        start() + chrono::Duration::seconds(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

#[must_use]
pub fn signer(padding: Padding) -> Signer {
    Signer::from_pem(KEY_ID, &SecretString::from(PRIVATE_KEY.to_owned()))
        .unwrap()
        .with_padding(padding)
}

/// Millisecond backoff so retry tests stay fast.
#[must_use]
pub fn fast_config(max_attempts: u32) -> Config {
    Config::builder()
        .max_attempts(max_attempts)
        .base_delay(Duration::from_millis(5))
        .max_delay(Duration::from_millis(20))
        .build()
}

/// A client against `server` whose signatures are deterministic and whose clock is stepped, so
/// mocks can match on exact header values.
pub fn deterministic_client(server: &MockServer, max_attempts: u32) -> anyhow::Result<Client> {
    let config = fast_config(max_attempts);
    let dispatcher = Dispatcher::new(
        Url::parse(&server.url(BASE_PATH))?,
        Arc::new(signer(Padding::Pkcs1v15)),
        HttpTransport::default(),
    )
    .with_policy(config.backoff_policy())
    .with_max_attempts(config.max_attempts())
    .with_clock(SteppingClock::default());

    Ok(Client::from_dispatcher(dispatcher))
}

pub fn client(server: &MockServer, config: Config) -> anyhow::Result<Client> {
    Ok(Client::new(
        &server.url(BASE_PATH),
        signer(Padding::Pss),
        config,
    )?)
}

/// Expected `Authorization` value for a deterministic client's attempt `ordinal`.
pub fn expected_authorization(
    ordinal: i64,
    method: &reqwest::Method,
    path_and_query: &str,
    body: &[u8],
) -> String {
    let signer = signer(Padding::Pkcs1v15);
    let timestamp = start() + chrono::Duration::seconds(ordinal - 1);
    let signature = signer
        .sign(timestamp, method, path_and_query, body)
        .unwrap();

    signer.authorization_header(&signature)
}
