//! Common test utilities for sealstream integration tests
//!
//! Shared fixtures: an in-memory transport standing in for the HTTP server
//! and helpers that package small assets.

#![allow(dead_code)]

use async_trait::async_trait;
use sealstream::{
    ManifestCodec, PackagedAsset, Packager, StreamConfig, Transport, TransportError,
    TransportResponse,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Base URL the in-memory transport serves from.
pub const ORIGIN: &str = "https://media.example.com/asset";

/// Plaintext bodies of the three-segment fixture asset.
pub fn segment_bodies() -> Vec<(String, Vec<u8>)> {
    vec![
        ("seg_000.ts".to_string(), b"first segment payload".to_vec()),
        ("seg_001.ts".to_string(), vec![0x47; 188 * 4]),
        ("seg_002.ts".to_string(), b"third and final segment".to_vec()),
    ]
}

pub fn package(segments: &[(String, Vec<u8>)]) -> PackagedAsset {
    Packager::new(StreamConfig::default())
        .package(segments)
        .expect("packaging should succeed")
}

pub fn url(name: &str) -> String {
    format!("{}/{}", ORIGIN, name)
}

/// Serves fixed responses from memory. Each fetch yields to the scheduler a
/// random number of times so concurrent requests interleave.
#[derive(Default)]
pub struct MemoryTransport {
    responses: Mutex<HashMap<String, TransportResponse>>,
    pub requests: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: impl Into<String>, body: impl Into<bytes::Bytes>) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.into(), TransportResponse::ok(body));
    }

    pub fn serve_status(&self, url: impl Into<String>, status: u16) {
        self.responses.lock().unwrap().insert(
            url.into(),
            TransportResponse {
                status,
                body: bytes::Bytes::new(),
            },
        );
    }

    /// Publish a packaged asset under [`ORIGIN`] with `manifest` as its playlist.
    pub fn publish(&self, asset: &PackagedAsset, manifest: &str) {
        self.serve(url("playlist.m3u8"), manifest.to_string());
        for segment in &asset.segments {
            self.serve(url(&segment.name), segment.data.clone());
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn fetch(
        &self,
        url: &str,
        _timeout: Option<Duration>,
    ) -> Result<TransportResponse, TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let yields = rand::random::<u8>() % 5;
        for _ in 0..yields {
            tokio::task::yield_now().await;
        }
        self.responses
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| TransportError::new(url, "connection refused"))
    }
}

pub fn memory_transport() -> Arc<MemoryTransport> {
    Arc::new(MemoryTransport::new())
}

pub fn codec() -> ManifestCodec {
    StreamConfig::default().codec()
}
