//! Process-wide state shared by every handler.

use std::{sync::Arc, time::Duration};

use crate::services::{storage_backend::StorageBackend, url_signer::UrlSigner};

/// Validity of links issued by `/get-download-link`.
pub const DEFAULT_PRESIGN_TTL: Duration = Duration::from_secs(5 * 60);

/// Read-only after startup; cloned into each request.
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn StorageBackend>,
    pub signer: UrlSigner,
    pub max_upload_bytes: usize,
    pub presign_ttl: Duration,
}

impl AppState {
    pub fn new(backend: Arc<dyn StorageBackend>, signer: UrlSigner, max_upload_bytes: usize) -> Self {
        Self {
            backend,
            signer,
            max_upload_bytes,
            presign_ttl: DEFAULT_PRESIGN_TTL,
        }
    }

    pub fn bucket(&self) -> &str {
        self.backend.bucket()
    }
}
