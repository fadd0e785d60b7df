use crate::error::{RebacError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const NOOP: &str = "noop";

/// Marker of a committed point in a tenant's relationship history.
///
/// `Noop` means "latest" and is resolved against the store head before any
/// read happens, so that every read of one check observes the same snapshot.
/// Versions grow monotonically with each committed write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SnapshotToken {
    #[default]
    Noop,
    Version(u64),
}

impl SnapshotToken {
    pub fn noop() -> Self {
        Self::Noop
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Self::Noop)
    }

    pub fn version(&self) -> Option<u64> {
        match self {
            Self::Noop => None,
            Self::Version(version) => Some(*version),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Noop => NOOP.to_string(),
            Self::Version(version) => URL_SAFE_NO_PAD.encode(version.to_be_bytes()),
        }
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        if encoded.is_empty() || encoded == NOOP {
            return Ok(Self::Noop);
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| RebacError::InvalidArgument(format!("malformed snapshot token: {}", e)))?;
        let bytes: [u8; 8] = bytes.try_into().map_err(|_| {
            RebacError::InvalidArgument(format!("malformed snapshot token: {}", encoded))
        })?;
        Ok(Self::Version(u64::from_be_bytes(bytes)))
    }
}

impl fmt::Display for SnapshotToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for SnapshotToken {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

impl TryFrom<String> for SnapshotToken {
    type Error = RebacError;

    fn try_from(value: String) -> Result<Self> {
        Self::decode(&value)
    }
}

impl From<SnapshotToken> for String {
    fn from(token: SnapshotToken) -> Self {
        token.encode()
    }
}
