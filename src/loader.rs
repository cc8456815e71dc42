//! Fetch interceptor that decrypts segments on their way to the player.
//!
//! The playback engine creates a loader per resource through a
//! [`LoaderFactory`]. Each loader fetches its URL through a [`Transport`] and
//! then:
//!
//! 1. For text responses, parses the manifest, installs the key and nonce
//!    table into the shared [`SessionContext`] and returns the cleaned
//!    manifest. Manifests without a key directive pass through unchanged.
//! 2. For binary responses naming an encrypted segment, looks up the nonce
//!    by basename and returns the decrypted bytes.
//! 3. Passes everything else through.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::crypto::{CipherError, SegmentCipher};
use crate::manifest::{basename, ManifestCodec, ManifestError};
use crate::session::SessionContext;
use crate::transport::{Transport, TransportError};

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Decryption failed for {segment}: {source}")]
    Cipher {
        segment: String,
        #[source]
        source: CipherError,
    },

    #[error("No nonce known for segment {segment}")]
    NonceNotFound { segment: String },

    #[error("No key available to decrypt segment {segment}")]
    KeyUnavailable { segment: String },

    #[error("HTTP {status} for URL: {url}")]
    Network { status: u16, url: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Response for {url} is not valid UTF-8 text")]
    InvalidText { url: String },

    #[error("Load aborted")]
    Aborted,
}

impl LoaderError {
    /// HTTP status code of a [`LoaderError::Network`] failure.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            LoaderError::Network { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Failures the engine may retry: transport errors and server-side or
    /// throttling statuses.
    pub fn is_retryable(&self) -> bool {
        match self {
            LoaderError::Transport(_) => true,
            LoaderError::Network { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            _ => false,
        }
    }

    /// Errors that end playback.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable() && !matches!(self, LoaderError::Aborted)
    }

    /// Whether the bytes failed authentication.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            LoaderError::Cipher {
                source: CipherError::Integrity,
                ..
            }
        )
    }
}

/// Body type the engine expects for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Text,
    Binary,
}

#[derive(Debug, Clone)]
pub struct LoaderContext {
    pub url: String,
    pub response_type: ResponseType,
}

impl LoaderContext {
    pub fn new(url: impl Into<String>, response_type: ResponseType) -> Self {
        Self {
            url: url.into(),
            response_type,
        }
    }
}

/// Per-request settings supplied by the engine. Timeouts are enforced by the
/// transport.
#[derive(Debug, Clone, Default)]
pub struct LoaderConfig {
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub enum LoaderPayload {
    Text(String),
    Binary(Bytes),
}

impl LoaderPayload {
    pub fn len(&self) -> usize {
        match self {
            LoaderPayload::Text(text) => text.len(),
            LoaderPayload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct LoaderStats {
    /// Bytes received from the transport.
    pub loaded_bytes: usize,
    /// Time from request to delivered payload.
    pub elapsed: Duration,
    pub decrypted: bool,
}

/// Completion callbacks. Exactly one is invoked per non-aborted load.
pub trait LoaderCallbacks: Send {
    fn on_success(&mut self, payload: LoaderPayload, stats: LoaderStats, context: &LoaderContext);
    fn on_error(&mut self, error: LoaderError, context: &LoaderContext);
}

/// The engine's pluggable loader extension point.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(
        &self,
        context: LoaderContext,
        config: LoaderConfig,
        callbacks: Box<dyn LoaderCallbacks>,
    );

    /// Stop delivering a result for the current load.
    fn abort(&self);

    /// Release the loader. Shared session state is left untouched.
    fn destroy(&self);
}

/// Creates loaders bound to one session.
pub type LoaderFactory = Arc<dyn Fn() -> Box<dyn Loader> + Send + Sync>;

pub struct StreamingDecryptLoader {
    session: SessionContext,
    transport: Arc<dyn Transport>,
    codec: Arc<ManifestCodec>,
    aborted: AtomicBool,
    destroyed: AtomicBool,
    abort_signal: Notify,
}

impl StreamingDecryptLoader {
    pub fn new(
        session: SessionContext,
        transport: Arc<dyn Transport>,
        codec: Arc<ManifestCodec>,
    ) -> Self {
        Self {
            session,
            transport,
            codec,
            aborted: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            abort_signal: Notify::new(),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.aborted.load(Ordering::SeqCst) || self.destroyed.load(Ordering::SeqCst)
    }

    /// Fetch and transform one resource.
    pub async fn fetch(
        &self,
        context: &LoaderContext,
        config: &LoaderConfig,
    ) -> Result<(LoaderPayload, LoaderStats), LoaderError> {
        let started = Instant::now();
        let response = self.transport.fetch(&context.url, config.timeout).await?;
        if !response.is_success() {
            return Err(LoaderError::Network {
                status: response.status,
                url: context.url.clone(),
            });
        }

        let loaded_bytes = response.body.len();
        let (payload, decrypted) = match context.response_type {
            ResponseType::Text => {
                let text = String::from_utf8(response.body.to_vec()).map_err(|_| {
                    LoaderError::InvalidText {
                        url: context.url.clone(),
                    }
                })?;
                (LoaderPayload::Text(self.process_manifest(&text, &context.url)?), false)
            }
            ResponseType::Binary if self.codec.is_encrypted(&context.url) => (
                LoaderPayload::Binary(self.decrypt_segment(&context.url, &response.body)?),
                true,
            ),
            ResponseType::Binary => (LoaderPayload::Binary(response.body), false),
        };

        let stats = LoaderStats {
            loaded_bytes,
            elapsed: started.elapsed(),
            decrypted,
        };
        trace!(url = %context.url, ?stats, "load complete");
        Ok((payload, stats))
    }

    /// Install the manifest's keys and return the text for the player.
    pub fn process_manifest(&self, text: &str, url: &str) -> Result<String, LoaderError> {
        Ok(self.session.load_manifest(&self.codec, text, url)?)
    }

    /// Decrypt an encrypted segment fetched from `url`.
    pub fn decrypt_segment(&self, url: &str, ciphertext: &[u8]) -> Result<Bytes, LoaderError> {
        let segment = basename(url).to_string();
        let keys = self.session.snapshot();

        let nonce = keys
            .as_ref()
            .and_then(|keys| keys.nonces.get(&segment).copied())
            .ok_or_else(|| LoaderError::NonceNotFound {
                segment: segment.clone(),
            })?;
        let key = keys
            .as_ref()
            .and_then(|keys| keys.key.as_ref())
            .ok_or_else(|| LoaderError::KeyUnavailable {
                segment: segment.clone(),
            })?;

        match SegmentCipher::open(ciphertext, key, &nonce) {
            Ok(plaintext) => {
                debug!(segment = %segment, bytes = plaintext.len(), "decrypted segment");
                Ok(Bytes::from(plaintext))
            }
            Err(source) => {
                warn!(segment = %segment, error = %source, "segment decryption failed");
                Err(LoaderError::Cipher { segment, source })
            }
        }
    }
}

#[async_trait]
impl Loader for StreamingDecryptLoader {
    async fn load(
        &self,
        context: LoaderContext,
        config: LoaderConfig,
        mut callbacks: Box<dyn LoaderCallbacks>,
    ) {
        if self.is_cancelled() {
            return;
        }

        let outcome = tokio::select! {
            outcome = self.fetch(&context, &config) => outcome,
            _ = self.abort_signal.notified() => {
                debug!(url = %context.url, "load aborted");
                return;
            }
        };

        // The transport may have completed after an abort was requested.
        if self.is_cancelled() {
            return;
        }

        match outcome {
            Ok((payload, stats)) => callbacks.on_success(payload, stats, &context),
            Err(error) => callbacks.on_error(error, &context),
        }
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.abort_signal.notify_one();
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.abort_signal.notify_one();
    }
}
