//! Sensitive values.
//!
//! A [`SecretValue`] never appears in `Debug` output and cannot be
//! serialized, so it cannot leak into persisted state by accident. Only an
//! HMAC-SHA256 digest under the workspace's [`DigestKey`] is written into
//! resource config, so guessable plaintexts cannot be confirmed offline from
//! a copy of the state file alone.

use std::collections::BTreeMap;
use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{CoreError, CoreResult};

type HmacSha256 = Hmac<Sha256>;

/// Per-workspace key for secret digests.
#[derive(Clone, PartialEq, Eq)]
pub struct DigestKey([u8; DigestKey::LEN]);

impl DigestKey {
    pub const LEN: usize = 32;

    /// A fresh key from the operating system's entropy source.
    pub fn generate() -> CoreResult<Self> {
        let mut bytes = [0u8; Self::LEN];
        getrandom::getrandom(&mut bytes).map_err(|e| CoreError::Entropy(e.to_string()))?;
        Ok(Self(bytes))
    }

    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> CoreResult<Self> {
        let bytes = <[u8; Self::LEN]>::try_from(bytes).map_err(|_| CoreError::InvalidDigestKey {
            expected: Self::LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl fmt::Debug for DigestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DigestKey(***)")
    }
}

/// Plaintext secret material.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the plaintext. Only the secret coordinator should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Hex-encoded HMAC-SHA256 of the plaintext under `key`.
    pub fn digest(&self, key: &DigestKey) -> String {
        let mut mac =
            HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts keys of any length");
        mac.update(self.0.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

/// Secret values keyed by secret resource id, kept beside the resource
/// graph rather than inside it.
#[derive(Debug, Clone, Default)]
pub struct SecretBundle {
    values: BTreeMap<String, SecretValue>,
}

impl SecretBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, resource_id: &str, value: SecretValue) {
        self.values.insert(resource_id.to_string(), value);
    }

    pub fn get(&self, resource_id: &str) -> Option<&SecretValue> {
        self.values.get(resource_id)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
