//! Request authentication: the canonical message, the signing [`Identity`] and the [`Signer`]
//! that turns one into exchange headers.
//!
//! Every authenticated request carries two headers built from a single captured timestamp:
//!
//! | Header | Value |
//! |--------|-------|
//! | [`TIMESTAMP_HEADER`] | `YYYY-MM-DDTHH:MM:SSZ` |
//! | [`AUTHORIZATION`] | `<scheme> <keyId>:<base64 signature>` |
//!
//! The signature covers `timestamp ++ method ++ path ++ body` with no separators, where `path`
//! includes the query string exactly as transmitted.

use std::fmt;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
pub use reqwest::header::AUTHORIZATION;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, Request};
use rsa::pkcs1::DecodeRsaPrivateKey as _;
use rsa::pkcs8::DecodePrivateKey as _;
use rsa::rand_core::OsRng;
use rsa::signature::{RandomizedSigner as _, SignatureEncoding as _, Signer as _};
use rsa::{pkcs1v15, pss};
/// RSA key types accepted by [`Identity`].
pub use rsa::{RsaPrivateKey, RsaPublicKey};
/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use url::Url;

use crate::error::Error;
use crate::{KEY_ID_VAR, PRIVATE_KEY_VAR, Result, Timestamp};

/// Header carrying the timestamp embedded in the signed message.
pub const TIMESTAMP_HEADER: &str = "X-Api-Timestamp";

/// Default token placed before `<keyId>:<signature>` in the [`AUTHORIZATION`] header.
pub const DEFAULT_SCHEME: &str = "RSA-SHA256";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// The key id and private key an exchange account authenticates with.
///
/// Immutable once built. The private key never appears in [`fmt::Debug`] output.
#[derive(Clone)]
pub struct Identity {
    key_id: String,
    private_key: RsaPrivateKey,
}

impl Identity {
    pub fn new<S: Into<String>>(key_id: S, private_key: RsaPrivateKey) -> Result<Self> {
        let key_id = key_id.into();
        if key_id.trim().is_empty() {
            return Err(Error::configuration("key id is missing"));
        }
        if HeaderValue::from_str(&key_id).is_err() {
            return Err(Error::configuration(
                "key id contains characters that cannot be sent in a header",
            ));
        }

        Ok(Self {
            key_id,
            private_key,
        })
    }

    /// Parses a PEM encoded RSA private key, either PKCS#8 (`BEGIN PRIVATE KEY`) or
    /// PKCS#1 (`BEGIN RSA PRIVATE KEY`).
    pub fn from_pem<S: Into<String>>(key_id: S, pem: &SecretString) -> Result<Self> {
        let pem = pem.expose_secret().trim();
        if pem.is_empty() {
            return Err(Error::configuration("private key is missing"));
        }

        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| Error::configuration(format!("unable to parse private key: {e}")))?;

        Self::new(key_id, private_key)
    }

    pub fn from_pem_file<S: Into<String>, P: AsRef<Path>>(key_id: S, path: P) -> Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!(
                "unable to read private key from {}: {e}",
                path.display()
            ))
        })?;

        Self::from_pem(key_id, &SecretString::from(pem))
    }

    /// Reads the key id from [`KEY_ID_VAR`] and the PEM encoded private key from
    /// [`PRIVATE_KEY_VAR`].
    pub fn from_env() -> Result<Self> {
        let key_id = std::env::var(KEY_ID_VAR)
            .map_err(|_e| Error::configuration(format!("{KEY_ID_VAR} is not set")))?;
        let pem = std::env::var(PRIVATE_KEY_VAR)
            .map(SecretString::from)
            .map_err(|_e| Error::configuration(format!("{PRIVATE_KEY_VAR} is not set")))?;

        Self::from_pem(key_id, &pem)
    }

    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    #[must_use]
    pub fn public_key(&self) -> RsaPublicKey {
        self.private_key.to_public_key()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("key_id", &self.key_id)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// RSA signature padding.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Padding {
    /// RSASSA-PSS with MGF1(SHA-256) and a salt as long as the digest. Salts are random, so
    /// repeated signatures over the same message differ.
    #[default]
    Pss,
    /// RSASSA-PKCS1-v1_5. Signatures over the same message are identical.
    Pkcs1v15,
}

#[derive(Clone)]
enum SigningKey {
    Pss(pss::BlindedSigningKey<Sha256>),
    Pkcs1v15(pkcs1v15::SigningKey<Sha256>),
}

impl SigningKey {
    fn new(private_key: RsaPrivateKey, padding: Padding) -> Self {
        match padding {
            Padding::Pss => Self::Pss(pss::BlindedSigningKey::new(private_key)),
            Padding::Pkcs1v15 => Self::Pkcs1v15(pkcs1v15::SigningKey::new(private_key)),
        }
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signature = match self {
            Self::Pss(key) => {
                let signature: pss::Signature = key.try_sign_with_rng(&mut OsRng, message)?;
                signature.to_vec()
            }
            Self::Pkcs1v15(key) => {
                let signature: pkcs1v15::Signature = key.try_sign(message)?;
                signature.to_vec()
            }
        };

        Ok(signature)
    }
}

/// Signs canonical messages on behalf of one [`Identity`] and formats the exchange headers.
///
/// A [`Signer`] holds no mutable state and can be shared across concurrent operations
/// (typically behind an [`std::sync::Arc`]) without locking.
#[derive(Clone)]
pub struct Signer {
    identity: Identity,
    scheme: String,
    padding: Padding,
    key: SigningKey,
}

impl Signer {
    #[must_use]
    pub fn new(identity: Identity) -> Self {
        let key = SigningKey::new(identity.private_key.clone(), Padding::default());

        Self {
            identity,
            scheme: DEFAULT_SCHEME.to_owned(),
            padding: Padding::default(),
            key,
        }
    }

    pub fn from_pem<S: Into<String>>(key_id: S, pem: &SecretString) -> Result<Self> {
        Ok(Self::new(Identity::from_pem(key_id, pem)?))
    }

    /// Replaces the token placed before `<keyId>:<signature>` in the [`AUTHORIZATION`] header.
    pub fn with_scheme<S: Into<String>>(mut self, scheme: S) -> Result<Self> {
        let scheme = scheme.into();
        if scheme.is_empty() || scheme.chars().any(char::is_whitespace) {
            return Err(Error::configuration(format!(
                "authorization scheme `{scheme}` must be a single non-empty token"
            )));
        }
        if HeaderValue::from_str(&scheme).is_err() {
            return Err(Error::configuration(format!(
                "authorization scheme `{scheme}` cannot be sent in a header"
            )));
        }

        self.scheme = scheme;
        Ok(self)
    }

    #[must_use]
    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.key = SigningKey::new(self.identity.private_key.clone(), padding);
        self.padding = padding;
        self
    }

    #[must_use]
    pub fn key_id(&self) -> &str {
        self.identity.key_id()
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    #[must_use]
    pub fn padding(&self) -> Padding {
        self.padding
    }

    /// The public half of the identity, for verifying signatures produced by this signer.
    #[must_use]
    pub fn public_key(&self) -> RsaPublicKey {
        self.identity.public_key()
    }

    /// Signs the canonical message for these request parts and returns the base64 encoded
    /// signature.
    pub fn sign(
        &self,
        timestamp: Timestamp,
        method: &Method,
        path: &str,
        body: &[u8],
    ) -> Result<String> {
        let message = to_message(timestamp, method, path, body);
        let signature = self.key.sign(&message)?;

        Ok(STANDARD.encode(signature))
    }

    #[must_use]
    pub fn authorization_header(&self, signature: &str) -> String {
        format!("{} {}:{signature}", self.scheme, self.identity.key_id)
    }

    #[must_use]
    pub fn timestamp_header(&self, timestamp: Timestamp) -> String {
        format_timestamp(timestamp)
    }

    /// Returns the [`HeaderMap`] authenticating `request`, signed over its method, its path and
    /// query as they will be transmitted, and its body bytes.
    ///
    /// `timestamp` is used for both the signed message and [`TIMESTAMP_HEADER`].
    pub fn create_headers(&self, request: &Request, timestamp: Timestamp) -> Result<HeaderMap> {
        let body = match request.body() {
            Some(body) => body.as_bytes().ok_or_else(|| {
                Error::validation("streaming request bodies cannot be signed")
            })?,
            None => &[],
        };
        let path = path_and_query(request.url());

        let signature = self.sign(timestamp, request.method(), &path, body)?;

        let mut map = HeaderMap::new();
        map.insert(TIMESTAMP_HEADER, self.timestamp_header(timestamp).parse()?);
        map.insert(
            AUTHORIZATION,
            self.authorization_header(&signature).parse()?,
        );

        Ok(map)
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("identity", &self.identity)
            .field("scheme", &self.scheme)
            .field("padding", &self.padding)
            .finish_non_exhaustive()
    }
}

/// Formats `timestamp` as it appears in both the signed message and [`TIMESTAMP_HEADER`].
/// Sub-second precision is dropped.
#[must_use]
pub fn format_timestamp(timestamp: Timestamp) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

/// The path of `url` followed by `?query` when a query is present, exactly as it goes out on
/// the request line.
#[must_use]
pub fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_owned(),
    }
}

/// Builds the canonical message: `timestamp ++ method ++ path ++ body`, without separators.
///
/// The exchange rebuilds the same bytes independently, so `path` and `body` must be exactly what
/// is transmitted.
#[must_use]
pub fn to_message(timestamp: Timestamp, method: &Method, path: &str, body: &[u8]) -> Vec<u8> {
    let timestamp = format_timestamp(timestamp);
    let method = method.as_str();

    let mut message =
        Vec::with_capacity(timestamp.len() + method.len() + path.len() + body.len());
    message.extend_from_slice(timestamp.as_bytes());
    message.extend_from_slice(method.as_bytes());
    message.extend_from_slice(path.as_bytes());
    message.extend_from_slice(body);

    message
}
