//! Resource key derivation.
//!
//! Keys are a pure function of the locator string and the digest kind, so the
//! same link maps to the same entry across processes and sessions.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use md5::Md5;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::cache::entry::ResourceKey;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Unsupported digest: {0}")]
    UnsupportedDigest(String),

    #[error("Digest {digest} produced an unusable key: {reason}")]
    InvalidKey { digest: String, reason: String },
}

/// Named digest used to turn a locator into a [`ResourceKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum DigestKind {
    /// Hex MD5 of the locator.
    #[default]
    Md5,
    /// Hex SHA-1 of the locator.
    Sha1,
    /// Hex SHA-256 of the locator.
    Sha256,
    /// Base58 of the locator bytes (reversible, length-limited).
    Base58,
    /// A function registered on the [`KeyCodec`] under this name.
    Custom(String),
}

impl fmt::Display for DigestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestKind::Md5 => write!(f, "md5"),
            DigestKind::Sha1 => write!(f, "sha1"),
            DigestKind::Sha256 => write!(f, "sha256"),
            DigestKind::Base58 => write!(f, "base58"),
            DigestKind::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

impl FromStr for DigestKind {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(DigestKind::Md5),
            "sha1" => Ok(DigestKind::Sha1),
            "sha256" => Ok(DigestKind::Sha256),
            "base58" => Ok(DigestKind::Base58),
            _ => match s.split_once(':') {
                Some((prefix, name)) if prefix.eq_ignore_ascii_case("custom") && !name.is_empty() => {
                    Ok(DigestKind::Custom(name.to_string()))
                }
                _ => Err(KeyError::UnsupportedDigest(s.to_string())),
            },
        }
    }
}

impl Serialize for DigestKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DigestKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Caller-supplied digest function.
pub type CustomDigest = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Computes resource keys. Holds the registered custom digests.
#[derive(Clone, Default)]
pub struct KeyCodec {
    custom: HashMap<String, CustomDigest>,
}

impl fmt::Debug for KeyCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.custom.keys().collect();
        names.sort();
        f.debug_struct("KeyCodec").field("custom", &names).finish()
    }
}

impl KeyCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom digest, addressable as `DigestKind::Custom(name)`.
    pub fn register<F>(&mut self, name: impl Into<String>, digest: F)
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.custom.insert(name.into(), Arc::new(digest));
    }

    /// Derive the key for `locator`. Pure: no I/O, same inputs give the same key.
    pub fn compute_key(&self, locator: &str, kind: &DigestKind) -> Result<ResourceKey, KeyError> {
        let raw = match kind {
            DigestKind::Md5 => hex::encode(Md5::digest(locator.as_bytes())),
            DigestKind::Sha1 => hex::encode(Sha1::digest(locator.as_bytes())),
            DigestKind::Sha256 => hex::encode(Sha256::digest(locator.as_bytes())),
            DigestKind::Base58 => bs58::encode(locator.as_bytes()).into_string(),
            DigestKind::Custom(name) => {
                let digest = self
                    .custom
                    .get(name)
                    .ok_or_else(|| KeyError::UnsupportedDigest(kind.to_string()))?;
                digest(locator)
            }
        };

        ResourceKey::parse(raw).map_err(|reason| KeyError::InvalidKey {
            digest: kind.to_string(),
            reason,
        })
    }
}
