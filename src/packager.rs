//! Encode pipeline: plaintext segments in, encrypted segments plus an
//! extended manifest and a metadata record out.
//!
//! # Example
//!
//! ```no_run
//! use sealstream::{Packager, StreamConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let asset = Packager::new(StreamConfig::default())
//!     .package_dir("segments/", "public/asset-1/")?;
//! println!("wrote {} segments", asset.metadata.segments.len());
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::crypto::{CipherError, SegmentCipher, ALGORITHM};
use crate::keys::{generate_key, MasterKey};
use crate::manifest::ManifestSegment;

#[derive(Debug, Error)]
pub enum PackagerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Encryption of {segment} failed: {source}")]
    Cipher {
        segment: String,
        #[source]
        source: CipherError,
    },
    #[error("No .{extension} segments found in {}", .dir.display())]
    NoSegments { dir: PathBuf, extension: String },
    #[error("Segment name {0:?} is not valid UTF-8")]
    InvalidName(PathBuf),
}

/// Per-segment entry of the metadata record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentRecord {
    pub name: String,
    pub nonce: String,
    #[serde(rename = "plaintextSize")]
    pub plaintext_size: u64,
    #[serde(rename = "encryptedSize")]
    pub encrypted_size: u64,
    /// Hex SHA-256 of the encrypted bytes.
    pub sha256: String,
}

/// Side-channel record for catalog tooling. The decrypt path never reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetMetadata {
    #[serde(rename = "assetId")]
    pub asset_id: Uuid,
    pub algorithm: String,
    /// Base64 master key.
    pub key: String,
    #[serde(rename = "segmentDuration")]
    pub segment_duration: f64,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub segments: Vec<SegmentRecord>,
}

impl AssetMetadata {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// One encrypted segment ready for storage.
#[derive(Debug, Clone)]
pub struct EncryptedSegment {
    pub name: String,
    pub data: Vec<u8>,
}

/// Everything the encode pipeline produces for one asset.
#[derive(Debug)]
pub struct PackagedAsset {
    pub key: MasterKey,
    pub segments: Vec<EncryptedSegment>,
    pub manifest: String,
    pub metadata: AssetMetadata,
}

pub struct Packager {
    config: StreamConfig,
}

impl Packager {
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Encrypted file name for a plaintext segment name.
    pub fn encrypted_name(&self, plaintext_name: &str) -> String {
        let encrypted = self.config.encrypted_extension.trim_start_matches('.');
        match plaintext_name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => format!("{}.{}", stem, encrypted),
            _ => format!("{}.{}", plaintext_name, encrypted),
        }
    }

    /// Encrypt in-memory segments, given in playback order.
    pub fn package(&self, segments: &[(String, Vec<u8>)]) -> Result<PackagedAsset, PackagerError> {
        let key = generate_key();
        let mut encrypted = Vec::with_capacity(segments.len());
        let mut manifest_segments = Vec::with_capacity(segments.len());
        let mut records = Vec::with_capacity(segments.len());

        for (index, (name, plaintext)) in segments.iter().enumerate() {
            let nonce = self.config.nonce_strategy.nonce_for(index as u64);
            let data = SegmentCipher::seal(plaintext, &key, &nonce).map_err(|source| {
                PackagerError::Cipher {
                    segment: name.clone(),
                    source,
                }
            })?;
            let encrypted_name = self.encrypted_name(name);
            debug!(segment = %encrypted_name, bytes = data.len(), "encrypted segment");

            records.push(SegmentRecord {
                name: encrypted_name.clone(),
                nonce: nonce.to_base64(),
                plaintext_size: plaintext.len() as u64,
                encrypted_size: data.len() as u64,
                sha256: hex_digest(&data),
            });
            manifest_segments.push(ManifestSegment {
                reference: encrypted_name.clone(),
                nonce,
                duration: self.config.segment_duration,
            });
            encrypted.push(EncryptedSegment {
                name: encrypted_name,
                data,
            });
        }

        let manifest =
            self.config
                .codec()
                .render(&manifest_segments, &key, self.config.target_duration());
        let metadata = AssetMetadata {
            asset_id: Uuid::new_v4(),
            algorithm: ALGORITHM.to_string(),
            key: key.to_base64(),
            segment_duration: self.config.segment_duration,
            created_at: Utc::now(),
            segments: records,
        };

        Ok(PackagedAsset {
            key,
            segments: encrypted,
            manifest,
            metadata,
        })
    }

    /// Read every `.<plaintext_extension>` file in `input` in lexical order,
    /// encrypt, and write the results to `output`.
    pub fn package_dir<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        input: P,
        output: Q,
    ) -> Result<PackagedAsset, PackagerError> {
        let input = input.as_ref();
        let output = output.as_ref();

        let paths = self.segment_paths(input)?;
        let mut segments = Vec::with_capacity(paths.len());
        for path in paths {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| PackagerError::InvalidName(path.clone()))?
                .to_string();
            segments.push((name, fs::read(&path)?));
        }

        let asset = self.package(&segments)?;

        fs::create_dir_all(output)?;
        for segment in &asset.segments {
            write_atomic(output, &segment.name, &segment.data)?;
        }
        write_atomic(output, &self.config.manifest_name, asset.manifest.as_bytes())?;
        write_atomic(
            output,
            &self.config.metadata_name,
            asset.metadata.to_json()?.as_bytes(),
        )?;

        info!(
            asset_id = %asset.metadata.asset_id,
            segments = asset.segments.len(),
            output = %output.display(),
            "packaged asset"
        );
        Ok(asset)
    }

    fn segment_paths(&self, input: &Path) -> Result<Vec<PathBuf>, PackagerError> {
        let extension = self.config.plaintext_extension.trim_start_matches('.');
        let mut paths = Vec::new();
        for entry in fs::read_dir(input)? {
            let path = entry?.path();
            let matches = path.is_file()
                && path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case(extension));
            if matches {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return Err(PackagerError::NoSegments {
                dir: input.to_path_buf(),
                extension: extension.to_string(),
            });
        }
        paths.sort();
        Ok(paths)
    }
}

fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> Result<(), PackagerError> {
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(data)?;
    file.persist(dir.join(name)).map_err(|e| e.error)?;
    Ok(())
}

fn hex_digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
