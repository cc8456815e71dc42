//! Segment-level authenticated encryption for HLS-style streaming.
//!
//! Assets are packaged into AES-256-GCM encrypted segments plus an extended
//! manifest carrying the key and per-segment nonces. On playback a
//! [`StreamingDecryptLoader`] sits between the player and the network,
//! strips the extension tags from the manifest and decrypts each segment as
//! it arrives.

pub mod config;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod loader;
pub mod manifest;
pub mod packager;
pub mod session;
pub mod transport;

pub use config::{ConfigError, StreamConfig};
pub use crypto::{CipherError, SegmentCipher, ALGORITHM, TAG_LEN};
pub use error::SealStreamError;
pub use keys::{generate_key, generate_nonce, MasterKey, NonceStrategy, SegmentNonce};
pub use loader::{
    Loader, LoaderCallbacks, LoaderConfig, LoaderContext, LoaderError, LoaderFactory,
    LoaderPayload, LoaderStats, ResponseType, StreamingDecryptLoader,
};
pub use manifest::{ManifestCodec, ManifestError, ManifestSegment, NonceTable, ParsedManifest};
pub use packager::{AssetMetadata, PackagedAsset, Packager, PackagerError};
pub use session::{PlaybackSession, PlaybackState, SessionContext};
pub use transport::{HttpTransport, Transport, TransportError, TransportResponse};
