use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use thiserror::Error;

use crate::keys::{MasterKey, SegmentNonce, KEY_LEN, NONCE_LEN};

/// Length of the GCM authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Algorithm identifier recorded in manifests and metadata.
pub const ALGORITHM: &str = "AES-256-GCM";

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("Malformed {material}: expected {expected} bytes, got {actual}")]
    MalformedKeyMaterial {
        material: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Segment failed authentication (tampered, truncated, or wrong key/nonce)")]
    Integrity,
    #[error("Encryption failed: {0}")]
    AeadError(aes_gcm::Error),
}

impl CipherError {
    fn check_lengths(key: &[u8], nonce: &[u8]) -> Result<(), CipherError> {
        if key.len() != KEY_LEN {
            return Err(CipherError::MalformedKeyMaterial {
                material: "key",
                expected: KEY_LEN,
                actual: key.len(),
            });
        }
        if nonce.len() != NONCE_LEN {
            return Err(CipherError::MalformedKeyMaterial {
                material: "nonce",
                expected: NONCE_LEN,
                actual: nonce.len(),
            });
        }
        Ok(())
    }
}

/// AES-256-GCM cipher for whole segments.
///
/// Output layout is `[ciphertext][16-byte tag]`, so the ciphertext is always
/// exactly `plaintext.len() + TAG_LEN` bytes. The nonce is not stored in the
/// output; it travels in the manifest.
pub struct SegmentCipher;

impl SegmentCipher {
    /// Encrypt one segment.
    pub fn encrypt(
        plaintext: &[u8],
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        CipherError::check_lengths(key, nonce)?;
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| {
            CipherError::MalformedKeyMaterial {
                material: "key",
                expected: KEY_LEN,
                actual: key.len(),
            }
        })?;
        cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(CipherError::AeadError)
    }

    /// Decrypt one segment. Nothing is returned unless the tag verifies.
    pub fn decrypt(
        ciphertext: &[u8],
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        CipherError::check_lengths(key, nonce)?;
        if ciphertext.len() < TAG_LEN {
            return Err(CipherError::Integrity);
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| {
            CipherError::MalformedKeyMaterial {
                material: "key",
                expected: KEY_LEN,
                actual: key.len(),
            }
        })?;
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CipherError::Integrity)
    }

    /// Typed variant of [`SegmentCipher::encrypt`] without associated data.
    pub fn seal(
        plaintext: &[u8],
        key: &MasterKey,
        nonce: &SegmentNonce,
    ) -> Result<Vec<u8>, CipherError> {
        Self::encrypt(plaintext, key.as_bytes(), nonce.as_bytes(), &[])
    }

    /// Typed variant of [`SegmentCipher::decrypt`] without associated data.
    pub fn open(
        ciphertext: &[u8],
        key: &MasterKey,
        nonce: &SegmentNonce,
    ) -> Result<Vec<u8>, CipherError> {
        Self::decrypt(ciphertext, key.as_bytes(), nonce.as_bytes(), &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{generate_key, generate_nonce};

    #[test]
    fn test_encryption_decryption() -> Result<(), CipherError> {
        let key = generate_key();
        let nonce = generate_nonce();
        let data = b"Hello, segment!";

        let ciphertext = SegmentCipher::seal(data, &key, &nonce)?;
        assert_eq!(ciphertext.len(), data.len() + TAG_LEN);

        let decrypted = SegmentCipher::open(&ciphertext, &key, &nonce)?;
        assert_eq!(data, decrypted.as_slice());
        Ok(())
    }

    #[test]
    fn test_round_trip_various_sizes() -> Result<(), CipherError> {
        let key = generate_key();
        for size in [0usize, 1, 15, 16, 17, 1024, 188 * 1000] {
            let nonce = generate_nonce();
            let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let ciphertext = SegmentCipher::seal(&data, &key, &nonce)?;
            assert_eq!(ciphertext.len(), size + TAG_LEN);
            assert_eq!(SegmentCipher::open(&ciphertext, &key, &nonce)?, data);
        }
        Ok(())
    }

    #[test]
    fn test_every_bit_flip_is_detected() -> Result<(), CipherError> {
        let key = generate_key();
        let nonce = generate_nonce();
        let ciphertext = SegmentCipher::seal(b"tamper evident payload", &key, &nonce)?;

        for byte in 0..ciphertext.len() {
            for bit in 0..8 {
                let mut tampered = ciphertext.clone();
                tampered[byte] ^= 1 << bit;
                let result = SegmentCipher::open(&tampered, &key, &nonce);
                assert!(
                    matches!(result, Err(CipherError::Integrity)),
                    "bit {} of byte {} went undetected",
                    bit,
                    byte
                );
            }
        }
        Ok(())
    }

    #[test]
    fn test_truncated_ciphertext_is_integrity_error() -> Result<(), CipherError> {
        let key = generate_key();
        let nonce = generate_nonce();
        let ciphertext = SegmentCipher::seal(b"short", &key, &nonce)?;

        let result = SegmentCipher::open(&ciphertext[..ciphertext.len() - 1], &key, &nonce);
        assert!(matches!(result, Err(CipherError::Integrity)));

        let result = SegmentCipher::open(&ciphertext[..4], &key, &nonce);
        assert!(matches!(result, Err(CipherError::Integrity)));
        Ok(())
    }

    #[test]
    fn test_wrong_key_nonce_or_aad() -> Result<(), CipherError> {
        let key = generate_key();
        let nonce = generate_nonce();
        let ciphertext =
            SegmentCipher::encrypt(b"payload", key.as_bytes(), nonce.as_bytes(), b"seg-1")?;

        let other_key = generate_key();
        let other_nonce = generate_nonce();
        assert!(matches!(
            SegmentCipher::decrypt(&ciphertext, other_key.as_bytes(), nonce.as_bytes(), b"seg-1"),
            Err(CipherError::Integrity)
        ));
        assert!(matches!(
            SegmentCipher::decrypt(&ciphertext, key.as_bytes(), other_nonce.as_bytes(), b"seg-1"),
            Err(CipherError::Integrity)
        ));
        assert!(matches!(
            SegmentCipher::decrypt(&ciphertext, key.as_bytes(), nonce.as_bytes(), b"seg-2"),
            Err(CipherError::Integrity)
        ));

        let plaintext =
            SegmentCipher::decrypt(&ciphertext, key.as_bytes(), nonce.as_bytes(), b"seg-1")?;
        assert_eq!(plaintext, b"payload");
        Ok(())
    }

    #[test]
    fn test_invalid_key_and_nonce_lengths() {
        let nonce = [0u8; NONCE_LEN];
        let key = [0u8; KEY_LEN];

        for len in [31usize, 33] {
            let bad_key = vec![0u8; len];
            let enc = SegmentCipher::encrypt(b"x", &bad_key, &nonce, &[]);
            assert!(matches!(
                enc,
                Err(CipherError::MalformedKeyMaterial { material: "key", actual, .. }) if actual == len
            ));
            let dec = SegmentCipher::decrypt(&[0u8; 32], &bad_key, &nonce, &[]);
            assert!(matches!(
                dec,
                Err(CipherError::MalformedKeyMaterial { material: "key", .. })
            ));
        }

        for len in [11usize, 13] {
            let bad_nonce = vec![0u8; len];
            let enc = SegmentCipher::encrypt(b"x", &key, &bad_nonce, &[]);
            assert!(matches!(
                enc,
                Err(CipherError::MalformedKeyMaterial { material: "nonce", actual, .. }) if actual == len
            ));
            let dec = SegmentCipher::decrypt(&[0u8; 32], &key, &bad_nonce, &[]);
            assert!(matches!(
                dec,
                Err(CipherError::MalformedKeyMaterial { material: "nonce", .. })
            ));
        }
    }
}
