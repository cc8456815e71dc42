//! Unified error type for the sealstream public API
//!
//! Internal modules keep their domain-specific errors for precise handling.
//! This type lets applications funnel every failure through one `Result`.
//!
//! # Example
//!
//! ```no_run
//! use sealstream::SealStreamError;
//!
//! fn package() -> Result<(), SealStreamError> {
//!     // Module errors convert with `?`
//!     Ok(())
//! }
//! ```

use thiserror::Error;

use crate::config::ConfigError;
use crate::crypto::CipherError;
use crate::loader::LoaderError;
use crate::manifest::ManifestError;
use crate::packager::PackagerError;

/// Unified error type for all sealstream operations
///
/// # Error Categories
///
/// - **Cipher**: key/nonce length problems or failed authentication
/// - **Manifest**: malformed extended manifests
/// - **Loader**: fetch, lookup, or decrypt failures while streaming
/// - **Packager**: encode pipeline I/O and serialization
/// - **Config**: invalid configuration
#[derive(Debug, Error)]
pub enum SealStreamError {
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("Packager error: {0}")]
    Packager(#[from] PackagerError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl SealStreamError {
    /// Returns true if the error is potentially retryable
    ///
    /// Only network-level loader failures qualify; the data behind a failed
    /// decrypt does not change on refetch.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Loader(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Returns a suggestion for resolving this error
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Cipher(CipherError::MalformedKeyMaterial { .. }) => {
                Some("Key must be 32 bytes and nonce 12 bytes; check the manifest producer")
            }
            Self::Cipher(CipherError::Integrity)
            | Self::Loader(LoaderError::Cipher {
                source: CipherError::Integrity,
                ..
            }) => Some("Segment was modified or belongs to a different asset; re-package it"),
            Self::Loader(LoaderError::NonceNotFound { .. }) => {
                Some("Load the manifest for this asset before requesting its segments")
            }
            Self::Loader(LoaderError::KeyUnavailable { .. }) => {
                Some("The session key was revoked; reopen the manifest")
            }
            Self::Manifest(ManifestError::TruncatedNonceDirective { .. }) => {
                Some("Manifest appears truncated; fetch it again or re-package the asset")
            }
            Self::Config(_) => Some("Check the configuration file and SEALSTREAM_* variables"),
            _ => None,
        }
    }

    /// Returns true if this is a cryptographic error
    pub fn is_crypto_error(&self) -> bool {
        matches!(
            self,
            Self::Cipher(_) | Self::Loader(LoaderError::Cipher { .. })
        )
    }

    /// Returns true if this is a manifest format error
    pub fn is_manifest_error(&self) -> bool {
        matches!(
            self,
            Self::Manifest(_) | Self::Loader(LoaderError::Manifest(_))
        )
    }

    /// Returns true if this is a network or transport failure
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            Self::Loader(LoaderError::Network { .. } | LoaderError::Transport(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;

    #[test]
    fn test_error_categories() {
        let integrity = SealStreamError::from(CipherError::Integrity);
        assert!(integrity.is_crypto_error());
        assert!(!integrity.is_retryable());
        assert!(integrity.suggestion().is_some());

        let network = SealStreamError::from(LoaderError::Network {
            status: 503,
            url: "https://cdn/seg.enc".to_string(),
        });
        assert!(network.is_network_error());
        assert!(network.is_retryable());

        let transport = SealStreamError::from(LoaderError::from(TransportError::new(
            "https://cdn/seg.enc",
            "connection reset",
        )));
        assert!(transport.is_network_error());
        assert!(transport.is_retryable());

        let manifest = SealStreamError::from(LoaderError::from(
            ManifestError::TruncatedNonceDirective { line: 9 },
        ));
        assert!(manifest.is_manifest_error());
        assert!(!manifest.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SealStreamError::from(LoaderError::NonceNotFound {
            segment: "seg_002.enc".to_string(),
        });
        let msg = err.to_string();
        assert!(msg.contains("Loader error"));
        assert!(msg.contains("seg_002.enc"));
    }
}
