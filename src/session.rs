//! Shared key state and the playback session driving the loader.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::keys::MasterKey;
use crate::loader::{
    Loader, LoaderCallbacks, LoaderConfig, LoaderContext, LoaderError, LoaderFactory,
    LoaderPayload, LoaderStats, ResponseType, StreamingDecryptLoader,
};
use crate::manifest::{ManifestCodec, ManifestError, NonceTable};
use crate::transport::Transport;

/// Key material for the asset currently being played.
pub struct SessionKeys {
    pub key: Option<MasterKey>,
    pub nonces: NonceTable,
    pub generation: u64,
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("has_key", &self.key.is_some())
            .field("nonces", &self.nonces.len())
            .field("generation", &self.generation)
            .finish()
    }
}

/// Key and nonce table shared by every loader of one playback session.
///
/// Writers replace the whole [`SessionKeys`] snapshot; readers clone the
/// `Arc` and never observe a half-installed table. Dropping a loader never
/// clears the state.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    state: Arc<RwLock<Option<Arc<SessionKeys>>>>,
    generation: Arc<AtomicU64>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any previous asset's state. Returns the new generation.
    pub fn install(&self, key: MasterKey, nonces: NonceTable) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let keys = Arc::new(SessionKeys {
            key: Some(key),
            nonces,
            generation,
        });
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Some(keys);
        debug!(generation, "installed session keys");
        generation
    }

    pub fn snapshot(&self) -> Option<Arc<SessionKeys>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop the key but keep the nonce table; later segment fetches fail
    /// with `KeyUnavailable`.
    pub fn revoke_key(&self) {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = guard.as_ref() {
            *guard = Some(Arc::new(SessionKeys {
                key: None,
                nonces: current.nonces.clone(),
                generation: current.generation,
            }));
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Parse `text` with `codec` and install its keys.
    ///
    /// Returns the text to hand to the player: the cleaned manifest, or the
    /// input unchanged when it carries no key directive.
    pub fn load_manifest(
        &self,
        codec: &ManifestCodec,
        text: &str,
        url: &str,
    ) -> Result<String, ManifestError> {
        match codec.parse(text, Some(url)) {
            Ok(parsed) => {
                let segments = parsed.nonce_table.len();
                let generation = self.install(parsed.key, parsed.nonce_table);
                info!(url, segments, generation, "loaded encrypted manifest");
                Ok(parsed.cleaned_manifest)
            }
            Err(ManifestError::KeyNotFound { passthrough }) => {
                debug!(url, "manifest has no key directive, passing through");
                Ok(passthrough)
            }
            Err(e) => Err(e),
        }
    }

    /// Factory the playback engine calls to create loaders bound to this session.
    pub fn loader_factory(
        &self,
        transport: Arc<dyn Transport>,
        codec: Arc<ManifestCodec>,
    ) -> LoaderFactory {
        let session = self.clone();
        Arc::new(move || {
            Box::new(StreamingDecryptLoader::new(
                session.clone(),
                transport.clone(),
                codec.clone(),
            )) as Box<dyn Loader>
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Loading,
    Loaded,
    Error(String),
}

/// Player-side session: owns the shared context, hands out loaders and
/// tracks `idle -> loading -> loaded | error`.
pub struct PlaybackSession {
    context: SessionContext,
    codec: Arc<ManifestCodec>,
    factory: LoaderFactory,
    config: LoaderConfig,
    state: Mutex<PlaybackState>,
}

impl PlaybackSession {
    pub fn new(transport: Arc<dyn Transport>, codec: ManifestCodec, config: LoaderConfig) -> Self {
        let context = SessionContext::new();
        let codec = Arc::new(codec);
        let factory = context.loader_factory(transport, codec.clone());
        Self {
            context,
            codec,
            factory,
            config,
            state: Mutex::new(PlaybackState::Idle),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn loader_factory(&self) -> LoaderFactory {
        self.factory.clone()
    }

    pub fn state(&self) -> PlaybackState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, state: PlaybackState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Fetch and install the manifest at `url`, returning the cleaned text.
    ///
    /// Retryable failures leave the session in `Loading`.
    pub async fn open(&self, url: &str) -> Result<String, LoaderError> {
        self.set_state(PlaybackState::Loading);
        let context = LoaderContext::new(url, ResponseType::Text);
        match self.run_loader(context).await {
            Ok(LoaderPayload::Text(text)) => {
                self.set_state(PlaybackState::Loaded);
                Ok(text)
            }
            Ok(LoaderPayload::Binary(_)) => {
                let err = LoaderError::InvalidText {
                    url: url.to_string(),
                };
                self.set_state(PlaybackState::Error(err.to_string()));
                Err(err)
            }
            Err(e) => {
                if e.is_fatal() {
                    self.set_state(PlaybackState::Error(e.to_string()));
                } else {
                    warn!(url, error = %e, "transient manifest failure");
                }
                Err(e)
            }
        }
    }

    /// Install a manifest chosen from local content. It is addressed by a
    /// synthetic `blob:` URL so bare segment names get rewritten onto the
    /// codec's content root.
    pub fn open_local(&self, text: &str) -> Result<String, LoaderError> {
        self.set_state(PlaybackState::Loading);
        let url = format!("blob:local/{}", uuid::Uuid::new_v4());
        match self.context.load_manifest(&self.codec, text, &url) {
            Ok(cleaned) => {
                self.set_state(PlaybackState::Loaded);
                Ok(cleaned)
            }
            Err(e) => {
                let err = LoaderError::from(e);
                self.set_state(PlaybackState::Error(err.to_string()));
                Err(err)
            }
        }
    }

    /// Fetch one segment, decrypting it when it is an encrypted segment.
    pub async fn fetch_segment(&self, url: &str) -> Result<Bytes, LoaderError> {
        let context = LoaderContext::new(url, ResponseType::Binary);
        match self.run_loader(context).await {
            Ok(LoaderPayload::Binary(bytes)) => Ok(bytes),
            Ok(LoaderPayload::Text(text)) => Ok(Bytes::from(text)),
            Err(e) => {
                if e.is_fatal() {
                    self.set_state(PlaybackState::Error(e.to_string()));
                } else {
                    warn!(url, error = %e, "transient segment failure");
                }
                Err(e)
            }
        }
    }

    /// Forget the key. In-flight loaders keep their snapshot.
    pub fn close(&self) {
        self.context.revoke_key();
        self.set_state(PlaybackState::Idle);
    }

    async fn run_loader(&self, context: LoaderContext) -> Result<LoaderPayload, LoaderError> {
        let (tx, rx) = oneshot::channel();
        let loader = (self.factory)();
        loader
            .load(context, self.config.clone(), Box::new(ChannelCallbacks { tx: Some(tx) }))
            .await;
        loader.destroy();
        rx.await.unwrap_or(Err(LoaderError::Aborted))
    }
}

struct ChannelCallbacks {
    tx: Option<oneshot::Sender<Result<LoaderPayload, LoaderError>>>,
}

impl LoaderCallbacks for ChannelCallbacks {
    fn on_success(&mut self, payload: LoaderPayload, _stats: LoaderStats, _context: &LoaderContext) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(payload));
        }
    }

    fn on_error(&mut self, error: LoaderError, _context: &LoaderContext) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{generate_key, generate_nonce};

    #[test]
    fn test_install_replaces_previous_asset() {
        let context = SessionContext::new();
        assert!(context.snapshot().is_none());

        let mut first = NonceTable::new();
        first.insert("a.enc", generate_nonce());
        assert_eq!(context.install(generate_key(), first), 1);

        let mut second = NonceTable::new();
        second.insert("b.enc", generate_nonce());
        assert_eq!(context.install(generate_key(), second), 2);

        let snapshot = context.snapshot().unwrap();
        assert!(snapshot.nonces.get("a.enc").is_none());
        assert!(snapshot.nonces.get("b.enc").is_some());
        assert_eq!(snapshot.generation, 2);
    }

    #[test]
    fn test_old_snapshot_survives_replacement() {
        let context = SessionContext::new();
        let mut table = NonceTable::new();
        table.insert("a.enc", generate_nonce());
        context.install(generate_key(), table);

        let held = context.snapshot().unwrap();
        context.install(generate_key(), NonceTable::new());
        assert!(held.nonces.get("a.enc").is_some());
    }

    #[test]
    fn test_revoke_key_keeps_nonces() {
        let context = SessionContext::new();
        let mut table = NonceTable::new();
        table.insert("a.enc", generate_nonce());
        context.install(generate_key(), table);

        context.revoke_key();
        let snapshot = context.snapshot().unwrap();
        assert!(snapshot.key.is_none());
        assert!(snapshot.nonces.get("a.enc").is_some());
    }

    #[test]
    fn test_load_manifest_passthrough_keeps_state() {
        let context = SessionContext::new();
        let codec = ManifestCodec::default();
        let plain = "#EXTM3U\n#EXTINF:10.0,\nseg.ts\n#EXT-X-ENDLIST\n";
        let out = context
            .load_manifest(&codec, plain, "https://example.com/p.m3u8")
            .unwrap();
        assert_eq!(out, plain);
        assert!(context.snapshot().is_none());
        assert_eq!(context.generation(), 0);
    }

    #[test]
    fn test_session_debug_hides_key() {
        let context = SessionContext::new();
        context.install(generate_key(), NonceTable::new());
        let rendered = format!("{:?}", context.snapshot().unwrap());
        assert!(rendered.contains("has_key: true"));
    }
}
