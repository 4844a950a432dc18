//! Content digests.
//!
//! Every blob in the engine (layers and manifests) is addressed by the
//! SHA-256 of its bytes, rendered as `sha256:<hex>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{EngineError, Result};

const PREFIX: &str = "sha256:";

/// A `sha256:<64 hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Digest of raw bytes.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(format!("{}{}", PREFIX, hex::encode(hasher.finalize())))
    }

    /// Digest of a sequence of byte slices, hashed as one stream.
    pub fn of_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        Self(format!("{}{}", PREFIX, hex::encode(hasher.finalize())))
    }

    /// Hex portion without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.0[PREFIX.len()..]
    }

    /// First 12 hex characters, as shown in listings.
    pub fn short(&self) -> &str {
        &self.hex()[..12]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let hex_part = s.strip_prefix(PREFIX).ok_or_else(|| {
            EngineError::Other(format!("invalid digest '{}': missing sha256: prefix", s))
        })?;
        if hex_part.len() != 64 || !hex_part.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(EngineError::Other(format!(
                "invalid digest '{}': expected 64 lowercase hex characters",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for Digest {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}
