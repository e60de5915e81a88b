//! A string value which should never show up in logs: signing keys, passwords, tokens.

use std::{borrow::Cow, env::VarError, fmt, ops::Deref};

use base64::Engine as _;
use http::{header::InvalidHeaderValue, HeaderValue};
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// A secret string value.
///
/// The wrapper keeps the value out of debug output and zeroes owned
/// memory when dropped. Use [Secret::revealed] to get the underlying value.
#[derive(Clone, Deserialize, Serialize)]
#[serde(from = "String")]
pub struct Secret(Cow<'static, str>);

impl Secret {
    /// Read a secret from an environment variable.
    pub fn from_env(var: &str) -> Result<Self, VarError> {
        let value = std::env::var(var)?;
        Ok(Secret(value.into()))
    }

    /// A fresh random key: 32 bytes from the thread RNG, hex encoded.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::rng().fill(&mut key[..]);
        let secret = Secret(hex::encode(key).into());
        key.zeroize();
        secret
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        if let Cow::Owned(ref mut s) = self.0 {
            s.zeroize()
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

impl Secret {
    /// Expose the underlying value.
    pub fn revealed(&self) -> &str {
        self.0.deref()
    }

    /// The raw bytes, for use as a MAC key.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// `Basic base64(<username>:<secret>)`, marked sensitive.
    pub fn basic(&self, username: &str) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut credentials = format!("{username}:{}", self.revealed());
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials.as_bytes());
        credentials.zeroize();

        let mut header = HeaderValue::try_from(format!("Basic {encoded}"))?;
        header.set_sensitive(true);
        Ok(header)
    }
}

impl From<Cow<'static, str>> for Secret {
    fn from(inner: Cow<'static, str>) -> Self {
        Secret(inner)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret(value.into())
    }
}

impl From<&'static str> for Secret {
    fn from(value: &'static str) -> Self {
        Secret(value.into())
    }
}
