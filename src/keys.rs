//! Key and nonce generation for segment encryption.
//!
//! Every asset gets exactly one [`MasterKey`]; every segment encrypted under
//! that key gets its own [`SegmentNonce`]. Both are drawn from the operating
//! system CSPRNG.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of an AES-256 key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of a GCM nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Per-asset AES-256 key.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    /// Wraps raw key bytes, returning `None` when the length is not [`KEY_LEN`].
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Standard base64 encoding, as embedded in manifests and metadata.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl From<[u8; KEY_LEN]> for MasterKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// Per-segment GCM nonce.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentNonce([u8; NONCE_LEN]);

impl SegmentNonce {
    /// Wraps raw nonce bytes, returning `None` when the length is not [`NONCE_LEN`].
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; NONCE_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Nonce derived from a segment index: big-endian, left-padded with zeros.
    pub fn from_counter(index: u64) -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        bytes[NONCE_LEN - 8..].copy_from_slice(&index.to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl From<[u8; NONCE_LEN]> for SegmentNonce {
    fn from(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for SegmentNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentNonce({})", self.to_base64())
    }
}

/// Generate a fresh 256-bit master key.
pub fn generate_key() -> MasterKey {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    MasterKey(key)
}

/// Generate a fresh random 96-bit nonce.
///
/// Uniqueness rests on the birthday bound of a 96-bit value, which is
/// acceptable for assets of up to a few thousand segments. Larger encodings
/// should use [`NonceStrategy::Counter`].
pub fn generate_nonce() -> SegmentNonce {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    SegmentNonce(nonce)
}

/// How nonces are assigned to segments during packaging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NonceStrategy {
    /// Independent random draw per segment.
    #[default]
    Random,
    /// Segment index as the nonce. Deterministic uniqueness under one key.
    Counter,
}

impl NonceStrategy {
    /// Nonce for the segment at `index`.
    pub fn nonce_for(&self, index: u64) -> SegmentNonce {
        match self {
            NonceStrategy::Random => generate_nonce(),
            NonceStrategy::Counter => SegmentNonce::from_counter(index),
        }
    }
}

impl std::str::FromStr for NonceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(NonceStrategy::Random),
            "counter" => Ok(NonceStrategy::Counter),
            other => Err(format!("unknown nonce strategy '{}'", other)),
        }
    }
}
