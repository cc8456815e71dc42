use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::keys::NonceStrategy;
use crate::loader::LoaderConfig;
use crate::manifest::ManifestCodec;

pub const ENV_CONTENT_ROOT: &str = "SEALSTREAM_CONTENT_ROOT";
pub const ENV_NONCE_STRATEGY: &str = "SEALSTREAM_NONCE_STRATEGY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Settings shared by the packager and the playback side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Extension of segments produced by the media tool, e.g. `ts`.
    pub plaintext_extension: String,
    /// Extension given to encrypted segments.
    pub encrypted_extension: String,
    /// Duration of each segment in seconds.
    pub segment_duration: f64,
    pub manifest_name: String,
    pub metadata_name: String,
    /// Where segments live when a manifest is opened from local content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_root: Option<Url>,
    pub nonce_strategy: NonceStrategy,
    pub request_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            plaintext_extension: "ts".to_string(),
            encrypted_extension: "enc".to_string(),
            segment_duration: 10.0,
            manifest_name: "playlist.m3u8".to_string(),
            metadata_name: "asset.json".to_string(),
            content_root: None,
            nonce_strategy: NonceStrategy::Random,
            request_timeout_secs: 30,
        }
    }
}

impl StreamConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: StreamConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file, then apply environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: StreamConfig = serde_json::from_str(&contents)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = StreamConfig::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(root) = std::env::var(ENV_CONTENT_ROOT) {
            let url = Url::parse(&root).map_err(|e| ConfigError::Invalid {
                field: "content_root",
                reason: e.to_string(),
            })?;
            self.content_root = Some(url);
        }
        if let Ok(strategy) = std::env::var(ENV_NONCE_STRATEGY) {
            self.nonce_strategy = strategy.parse().map_err(|reason| ConfigError::Invalid {
                field: "nonce_strategy",
                reason,
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let plain = self.plaintext_extension.trim_start_matches('.');
        let encrypted = self.encrypted_extension.trim_start_matches('.');
        if plain.is_empty() {
            return Err(ConfigError::Invalid {
                field: "plaintext_extension",
                reason: "must not be empty".to_string(),
            });
        }
        if encrypted.is_empty() {
            return Err(ConfigError::Invalid {
                field: "encrypted_extension",
                reason: "must not be empty".to_string(),
            });
        }
        if plain.eq_ignore_ascii_case(encrypted) {
            return Err(ConfigError::Invalid {
                field: "encrypted_extension",
                reason: "must differ from plaintext_extension".to_string(),
            });
        }
        if !(self.segment_duration.is_finite() && self.segment_duration > 0.0) {
            return Err(ConfigError::Invalid {
                field: "segment_duration",
                reason: format!("{} is not a positive duration", self.segment_duration),
            });
        }
        Ok(())
    }

    /// Manifest codec matching this configuration.
    pub fn codec(&self) -> ManifestCodec {
        let codec = ManifestCodec::new(&self.encrypted_extension);
        match &self.content_root {
            Some(root) => codec.with_content_root(root.clone()),
            None => codec,
        }
    }

    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            timeout: Some(Duration::from_secs(self.request_timeout_secs)),
        }
    }

    /// `EXT-X-TARGETDURATION` for the configured segment length.
    pub fn target_duration(&self) -> u64 {
        self.segment_duration.ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StreamConfig::default();
        config.validate().unwrap();
        assert_eq!(config.target_duration(), 10);
        assert_eq!(config.codec().encrypted_extension(), "enc");
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = StreamConfig::from_json(
            r#"{"segment_duration": 6.5, "nonce_strategy": "counter",
                "content_root": "https://cdn.example.com/videos/"}"#,
        )
        .unwrap();
        assert_eq!(config.segment_duration, 6.5);
        assert_eq!(config.target_duration(), 7);
        assert_eq!(config.nonce_strategy, NonceStrategy::Counter);
        assert_eq!(config.encrypted_extension, "enc");
        assert!(config.content_root.is_some());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            StreamConfig::from_json(r#"{"encrypted_extension": "ts"}"#),
            Err(ConfigError::Invalid { field: "encrypted_extension", .. })
        ));
        assert!(matches!(
            StreamConfig::from_json(r#"{"segment_duration": 0}"#),
            Err(ConfigError::Invalid { field: "segment_duration", .. })
        ));
        assert!(matches!(
            StreamConfig::from_json(r#"{"plaintext_extension": ""}"#),
            Err(ConfigError::Invalid { field: "plaintext_extension", .. })
        ));
        assert!(matches!(
            StreamConfig::from_json(r#"{"nonce_strategy": "sequential"}"#),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"manifest_name": "index.m3u8"}"#).unwrap();
        let config = StreamConfig::from_file(&path).unwrap();
        assert_eq!(config.manifest_name, "index.m3u8");
    }
}
