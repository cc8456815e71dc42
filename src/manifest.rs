//! Extended HLS manifest carrying segment key material.
//!
//! The dialect is an ordinary media playlist with two extra tags:
//!
//! ```text
//! #EXT-X-SEGCRYPT-KEY:METHOD=AES-256-GCM,URI="data:text/plain;base64,<key>"
//! #EXT-X-SEGCRYPT-NONCE:<nonce>
//! ```
//!
//! The key tag appears once, before any segment. A nonce tag precedes the
//! segment reference it protects. [`ManifestCodec::parse`] strips both tags so
//! the remaining text is a plain playlist any player understands.

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine as _,
};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::crypto::ALGORITHM;
use crate::keys::{MasterKey, SegmentNonce, KEY_LEN, NONCE_LEN};

pub const KEY_DIRECTIVE: &str = "#EXT-X-SEGCRYPT-KEY:";
pub const NONCE_DIRECTIVE: &str = "#EXT-X-SEGCRYPT-NONCE:";

const KEY_URI_PREFIX: &str = "data:text/plain;base64,";

/// Accepts padded and unpadded input and ignores non-zero trailing bits.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest carries no key directive and should be treated as plain.
    /// `passthrough` holds the unmodified input.
    #[error("No key directive found in manifest")]
    KeyNotFound { passthrough: String },

    #[error("Nonce directive on line {line} is not followed by a segment reference")]
    TruncatedNonceDirective { line: usize },

    #[error("Key directive repeated on line {line}")]
    DuplicateKeyDirective { line: usize },

    #[error("Key directive on line {line} appears after segment or nonce lines")]
    MisplacedKeyDirective { line: usize },

    #[error("Nonce directive on line {line} follows another nonce directive")]
    DuplicateNonceDirective { line: usize },

    #[error("Unsupported encryption method: {method}")]
    UnsupportedMethod { method: String },

    #[error("Key directive on line {line} has no data URI")]
    MissingKeyUri { line: usize },

    #[error("Invalid key on line {line}: {reason}")]
    InvalidKey { line: usize, reason: String },

    /// Logged and skipped by [`ManifestCodec::parse`]; the segment it
    /// precedes is left without a nonce.
    #[error("Invalid nonce on line {line}: {reason}")]
    InvalidNonce { line: usize, reason: String },
}

/// One segment as it goes into [`ManifestCodec::render`].
#[derive(Debug, Clone)]
pub struct ManifestSegment {
    pub reference: String,
    pub nonce: SegmentNonce,
    pub duration: f64,
}

/// Segment basename to nonce, for one asset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NonceTable {
    entries: HashMap<String, SegmentNonce>,
}

impl NonceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the nonce previously stored under `basename`, if any.
    pub fn insert(&mut self, basename: impl Into<String>, nonce: SegmentNonce) -> Option<SegmentNonce> {
        self.entries.insert(basename.into(), nonce)
    }

    pub fn get(&self, basename: &str) -> Option<&SegmentNonce> {
        self.entries.get(basename)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SegmentNonce)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Output of [`ManifestCodec::parse`].
#[derive(Debug, Clone)]
pub struct ParsedManifest {
    pub key: MasterKey,
    pub nonce_table: NonceTable,
    pub cleaned_manifest: String,
}

/// Renders and parses the extended manifest dialect.
#[derive(Debug, Clone)]
pub struct ManifestCodec {
    encrypted_extension: String,
    content_root: Option<Url>,
}

impl Default for ManifestCodec {
    fn default() -> Self {
        Self::new("enc")
    }
}

impl ManifestCodec {
    /// Create a codec recognising segments whose name ends in `.<encrypted_extension>`.
    pub fn new(encrypted_extension: &str) -> Self {
        ManifestCodec {
            encrypted_extension: encrypted_extension.trim_start_matches('.').to_string(),
            content_root: None,
        }
    }

    /// Root URL used to rewrite bare encrypted segment names in manifests
    /// loaded from synthetic (`blob:` / `data:`) URLs.
    pub fn with_content_root(mut self, mut root: Url) -> Self {
        if !root.path().ends_with('/') {
            let path = format!("{}/", root.path());
            root.set_path(&path);
        }
        self.content_root = Some(root);
        self
    }

    pub fn encrypted_extension(&self) -> &str {
        &self.encrypted_extension
    }

    /// Whether a segment reference or URL names an encrypted segment.
    pub fn is_encrypted(&self, reference: &str) -> bool {
        let name = basename(reference);
        match name.rsplit_once('.') {
            Some((stem, ext)) => {
                !stem.is_empty() && ext.eq_ignore_ascii_case(&self.encrypted_extension)
            }
            None => false,
        }
    }

    /// Render a static (VOD) manifest for `segments` encrypted under `key`.
    pub fn render(
        &self,
        segments: &[ManifestSegment],
        key: &MasterKey,
        target_duration: u64,
    ) -> String {
        let mut out = String::new();
        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:3\n");
        out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", target_duration));
        out.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
        out.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");
        out.push_str(&format!(
            "{}METHOD={},URI=\"{}{}\"\n",
            KEY_DIRECTIVE,
            ALGORITHM,
            KEY_URI_PREFIX,
            key.to_base64()
        ));
        for segment in segments {
            out.push_str(&format!("#EXTINF:{:.6},\n", segment.duration));
            out.push_str(&format!("{}{}\n", NONCE_DIRECTIVE, segment.nonce.to_base64()));
            out.push_str(&segment.reference);
            out.push('\n');
        }
        out.push_str("#EXT-X-ENDLIST\n");
        out
    }

    /// Parse an extended manifest.
    ///
    /// `base_url` is the URL the manifest was loaded from, if known. Returns
    /// [`ManifestError::KeyNotFound`] for manifests without a key directive;
    /// callers should play those unchanged.
    pub fn parse(&self, text: &str, base_url: Option<&str>) -> Result<ParsedManifest, ManifestError> {
        if !text.lines().any(|l| l.trim_start().starts_with(KEY_DIRECTIVE)) {
            return Err(ManifestError::KeyNotFound {
                passthrough: text.to_string(),
            });
        }

        let rewrite_root = match (base_url, &self.content_root) {
            (Some(base), Some(root)) if is_synthetic_url(base) => Some(root),
            (Some(base), None) if is_synthetic_url(base) => {
                warn!(base, "synthetic manifest URL but no content root configured");
                None
            }
            _ => None,
        };

        let mut key: Option<MasterKey> = None;
        // A directive whose payload is unusable still claims the next reference.
        let mut pending: Option<(usize, Option<SegmentNonce>)> = None;
        let mut seen_media = false;
        let mut nonce_table = NonceTable::new();
        let mut cleaned = String::with_capacity(text.len());

        for (index, chunk) in text.split_inclusive('\n').enumerate() {
            let line_no = index + 1;
            let raw = chunk.trim_end_matches(['\n', '\r']);
            let terminator = &chunk[raw.len()..];
            let line = raw.trim();

            if let Some(attributes) = line.strip_prefix(KEY_DIRECTIVE) {
                if key.is_some() {
                    return Err(ManifestError::DuplicateKeyDirective { line: line_no });
                }
                if seen_media {
                    return Err(ManifestError::MisplacedKeyDirective { line: line_no });
                }
                key = Some(parse_key_directive(attributes, line_no)?);
                continue;
            }

            if let Some(payload) = line.strip_prefix(NONCE_DIRECTIVE) {
                if pending.is_some() {
                    return Err(ManifestError::DuplicateNonceDirective { line: line_no });
                }
                seen_media = true;
                let nonce = match parse_nonce(payload, line_no) {
                    Ok(nonce) => Some(nonce),
                    Err(e) => {
                        warn!(error = %e, "ignoring unusable nonce directive");
                        None
                    }
                };
                pending = Some((line_no, nonce));
                continue;
            }

            if line.is_empty() || line.starts_with('#') {
                cleaned.push_str(chunk);
                continue;
            }

            seen_media = true;
            let name = basename(line);
            match pending.take() {
                Some((_, Some(nonce))) => {
                    if nonce_table.insert(name, nonce).is_some() {
                        warn!(segment = name, line = line_no, "segment basename repeated, earlier nonce replaced");
                    }
                }
                Some((_, None)) => {}
                None if self.is_encrypted(line) => {
                    warn!(segment = name, line = line_no, "encrypted segment without nonce directive");
                }
                None => {}
            }

            match rewrite_root {
                Some(root) if self.is_encrypted(line) && is_bare_filename(line) => {
                    match root.join(line) {
                        Ok(absolute) => {
                            cleaned.push_str(absolute.as_str());
                            cleaned.push_str(terminator);
                        }
                        Err(e) => {
                            warn!(segment = line, error = %e, "could not rewrite segment URL");
                            cleaned.push_str(chunk);
                        }
                    }
                }
                _ => cleaned.push_str(chunk),
            }
        }

        if let Some((line, _)) = pending {
            return Err(ManifestError::TruncatedNonceDirective { line });
        }

        // The pre-scan guarantees a key directive exists.
        let key = key.ok_or_else(|| ManifestError::KeyNotFound {
            passthrough: text.to_string(),
        })?;

        debug!(segments = nonce_table.len(), "parsed extended manifest");
        Ok(ParsedManifest {
            key,
            nonce_table,
            cleaned_manifest: cleaned,
        })
    }
}

/// Final path component of a URL or path, without query or fragment.
pub fn basename(reference: &str) -> &str {
    let path = reference
        .split(['?', '#'])
        .next()
        .unwrap_or(reference);
    path.rsplit('/').next().unwrap_or(path)
}

/// Decode base64 in either the standard or URL-safe alphabet, with or
/// without padding, ignoring embedded whitespace.
pub fn decode_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let normalized: String = input
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            c => c,
        })
        .collect();
    LENIENT_BASE64.decode(normalized.trim_end_matches('='))
}

/// `blob:` and `data:` URLs are built from local content, not fetched.
fn is_synthetic_url(url: &str) -> bool {
    let lower = url.trim_start().to_ascii_lowercase();
    lower.starts_with("blob:") || lower.starts_with("data:")
}

fn is_bare_filename(reference: &str) -> bool {
    !reference.contains('/') && !reference.contains(':')
}

fn parse_key_directive(attributes: &str, line: usize) -> Result<MasterKey, ManifestError> {
    let mut method = None;
    let mut uri = None;
    for (name, value) in parse_attribute_list(attributes) {
        match name.as_str() {
            "METHOD" => method = Some(value),
            "URI" => uri = Some(value),
            _ => {}
        }
    }

    if let Some(method) = method {
        if !method.eq_ignore_ascii_case(ALGORITHM) {
            return Err(ManifestError::UnsupportedMethod { method });
        }
    }

    let uri = uri.ok_or(ManifestError::MissingKeyUri { line })?;
    let payload = uri
        .split_once(";base64,")
        .filter(|(scheme, _)| scheme.to_ascii_lowercase().starts_with("data:"))
        .map(|(_, payload)| payload)
        .ok_or(ManifestError::MissingKeyUri { line })?;

    let bytes = decode_base64(payload).map_err(|e| ManifestError::InvalidKey {
        line,
        reason: e.to_string(),
    })?;
    MasterKey::from_slice(&bytes).ok_or_else(|| ManifestError::InvalidKey {
        line,
        reason: format!("expected {} bytes, got {}", KEY_LEN, bytes.len()),
    })
}

fn parse_nonce(payload: &str, line: usize) -> Result<SegmentNonce, ManifestError> {
    let bytes = decode_base64(payload).map_err(|e| ManifestError::InvalidNonce {
        line,
        reason: e.to_string(),
    })?;
    SegmentNonce::from_slice(&bytes).ok_or_else(|| ManifestError::InvalidNonce {
        line,
        reason: format!("expected {} bytes, got {}", NONCE_LEN, bytes.len()),
    })
}

/// Split an HLS attribute list, honouring quoted values.
fn parse_attribute_list(input: &str) -> Vec<(String, String)> {
    let mut attributes = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    let mut flush = |item: &mut String| {
        if let Some((name, value)) = item.split_once('=') {
            attributes.push((
                name.trim().to_ascii_uppercase(),
                value.trim().trim_matches('"').to_string(),
            ));
        }
        item.clear();
    };

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => flush(&mut current),
            _ => current.push(c),
        }
    }
    flush(&mut current);
    attributes
}
