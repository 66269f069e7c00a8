//! Signing-service seam and the signature cache.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use mule_protocol::{FileIdentity, InitGrant, Signature, SignatureBundle, SignatureKind};
use tracing::debug;

/// Future returned by [`SigningService`] calls.
pub type SignFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SigningError>> + Send + 'a>>;

/// Errors reported by a signing service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SigningError {
    #[error("signing service unreachable: {0}")]
    Transport(String),

    #[error("signing service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed signing response: {0}")]
    Decode(String),
}

/// Identity of the upload a signature is requested for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningParams {
    pub key: String,
    pub upload_id: Option<String>,
    pub file: FileIdentity,
    /// Content type the storage requests carry.
    pub content_type: String,
    pub num_chunks: u32,
}

/// A trusted service that authorizes storage requests and records progress.
///
/// Implemented over HTTP by `mule-s3`; tests use an in-memory double.
pub trait SigningService: Send + Sync {
    /// Signature for initiating an upload.
    ///
    /// Unless `force` is set the service may report an unfinished upload of
    /// the same file instead.
    fn initiate(&self, params: SigningParams, force: bool) -> SignFuture<'_, InitGrant>;

    /// Signature for one operation of an initiated upload.
    fn sign(&self, kind: SignatureKind, params: SigningParams) -> SignFuture<'_, Signature>;

    /// Every chunk, list and finish signature in one round trip.
    fn sign_all(&self, params: SigningParams) -> SignFuture<'_, SignatureBundle>;

    /// Records that a part reached the backend.
    fn notify_chunk_uploaded(&self, params: SigningParams, part_number: u32) -> SignFuture<'_, ()>;

    /// Records that the upload was assembled.
    fn notify_upload_finished(&self, params: SigningParams) -> SignFuture<'_, ()>;
}

// ---------------------------------------------------------------------------
// SignatureCache
// ---------------------------------------------------------------------------

/// Memoized signatures of the current upload, cleared only on session reset.
#[derive(Debug, Default)]
pub struct SignatureCache {
    entries: Mutex<HashMap<SignatureKind, Signature>>,
}

impl SignatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<SignatureKind, Signature>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, kind: SignatureKind) -> Option<Signature> {
        self.entries().get(&kind).cloned()
    }

    pub fn put(&self, kind: SignatureKind, signature: Signature) {
        self.entries().insert(kind, signature);
    }

    /// Stores every signature of a bulk response.
    pub fn prime(&self, bundle: SignatureBundle) {
        let mut entries = self.entries();
        for (kind, signature) in bundle.into_entries() {
            entries.insert(kind, signature);
        }
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Returns the cached signature for `kind`, fetching it on first use.
    pub async fn fetch(
        &self,
        signer: &dyn SigningService,
        kind: SignatureKind,
        params: SigningParams,
    ) -> Result<Signature, SigningError> {
        if let Some(signature) = self.get(kind) {
            return Ok(signature);
        }
        debug!(kind = ?kind, "signature not cached; fetching");
        let signature = signer.sign(kind, params).await?;
        self.put(kind, signature.clone());
        Ok(signature)
    }
}
