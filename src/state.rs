use std::sync::Arc;

use chrono::Duration;

use crate::blobs::BlobStore;
use crate::cipher::CipherStream;
use crate::keys::EncryptionKey;
use crate::notify::Notifier;
use crate::store::SharedStore;
use crate::tokens::TokenIssuer;

/// Everything a request handler needs, built once at startup and shared
/// across workers.
pub struct AppState {
    pub store: SharedStore,
    pub blobs: BlobStore,
    pub cipher: CipherStream,
    pub issuer: TokenIssuer,
    pub notifier: Arc<dyn Notifier>,
    pub public_base_url: String,
    pub max_upload_bytes: u64,
}

impl AppState {
    pub fn new(
        store: SharedStore,
        blobs: BlobStore,
        key: Arc<EncryptionKey>,
        notifier: Arc<dyn Notifier>,
        token_lifetime_hours: i64,
        public_base_url: &str,
        max_upload_bytes: u64,
    ) -> Self {
        AppState {
            store,
            blobs,
            cipher: CipherStream::new(key),
            issuer: TokenIssuer::new(Duration::hours(token_lifetime_hours)),
            notifier,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            max_upload_bytes,
        }
    }

    /// Share-facing link. The token is the last path segment, never a query parameter.
    pub fn download_url(&self, token: &str) -> String {
        format!("{}/download/{}", self.public_base_url, token)
    }
}
