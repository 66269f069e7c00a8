//! Session state shared by the scheduler, reconciler and completion steps.

use std::sync::{Arc, Mutex, MutexGuard};

use mule_transfer::{ByteSource, ChunkLayout, ChunkProgress, ChunkRegistry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::UploaderConfig;
use crate::error::UploadError;
use crate::events::{SelectFilter, UploadEvent};
use crate::retry::RetryPolicy;
use crate::signing::{SignatureCache, SigningParams, SigningService};
use crate::transport::Transport;

/// Top-level state of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No upload running; a file may be selected or started.
    Idle,
    /// Initiating or reconciling the multipart upload.
    Initializing,
    /// Chunks are being uploaded.
    Uploading,
    /// The completion request is in progress.
    Finishing,
    Finished,
    Canceled,
}

/// Mutable per-session state, guarded by one mutex.
///
/// The lock is never held across an await point.
pub(crate) struct SessionCore {
    pub state: SessionState,
    pub source: Option<Arc<dyn ByteSource>>,
    pub key: String,
    pub upload_id: Option<String>,
    pub registry: Option<ChunkRegistry>,
    /// Consecutive failures, shared by every operation kind.
    pub retry_count: u32,
    pub start_fired: bool,
    pub active_run: Option<u64>,
    pub runs: u64,
}

impl SessionCore {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            source: None,
            key: String::new(),
            upload_id: None,
            registry: None,
            retry_count: 0,
            start_fired: false,
            active_run: None,
            runs: 0,
        }
    }

    pub fn registry(&self) -> Result<&ChunkRegistry, UploadError> {
        self.registry.as_ref().ok_or(UploadError::NoFileSelected)
    }

    pub fn registry_mut(&mut self) -> Result<&mut ChunkRegistry, UploadError> {
        self.registry.as_mut().ok_or(UploadError::NoFileSelected)
    }

    pub fn source(&self) -> Result<Arc<dyn ByteSource>, UploadError> {
        self.source.clone().ok_or(UploadError::NoFileSelected)
    }

    /// `(loaded, total)` bytes of the selected file.
    pub fn progress(&self) -> (u64, u64) {
        self.registry
            .as_ref()
            .map_or((0, 0), |r| (r.total_loaded(), r.total_size()))
    }

    pub fn signing_params(&self, config: &UploaderConfig) -> Result<SigningParams, UploadError> {
        let source = self.source.as_ref().ok_or(UploadError::NoFileSelected)?;
        let file = source.identity().clone();
        let content_type = if file.mime_type.is_empty() {
            config.content_type.clone()
        } else {
            file.mime_type.clone()
        };
        Ok(SigningParams {
            key: self.key.clone(),
            upload_id: self.upload_id.clone(),
            file,
            content_type,
            num_chunks: self.registry()?.chunk_count(),
        })
    }
}

/// Everything the background steps of an upload need.
pub(crate) struct Shared {
    pub config: UploaderConfig,
    pub transport: Arc<dyn Transport>,
    pub signer: Arc<dyn SigningService>,
    pub signatures: SignatureCache,
    pub retry: RetryPolicy,
    pub select_filter: Mutex<Option<SelectFilter>>,
    events_tx: mpsc::UnboundedSender<UploadEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<UploadEvent>>>,
    core: Mutex<SessionCore>,
    cancel: Mutex<CancellationToken>,
}

impl Shared {
    pub fn new(
        config: UploaderConfig,
        transport: Arc<dyn Transport>,
        signer: Arc<dyn SigningService>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            retry: RetryPolicy::from_config(&config),
            config,
            transport,
            signer,
            signatures: SignatureCache::new(),
            select_filter: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            core: Mutex::new(SessionCore::new()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn core(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Locks the session unless `cancel` has fired.
    ///
    /// Cancellation happens under the same lock, so a guard obtained here
    /// belongs to a session that has not been canceled.
    pub fn core_live(
        &self,
        cancel: &CancellationToken,
    ) -> Result<MutexGuard<'_, SessionCore>, UploadError> {
        let core = self.core();
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        Ok(core)
    }

    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<UploadEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn events(&self) -> mpsc::UnboundedSender<UploadEvent> {
        self.events_tx.clone()
    }

    pub fn emit(&self, event: UploadEvent) {
        // The receiver may have been dropped; events are best-effort.
        let _ = self.events_tx.send(event);
    }

    pub fn emit_progress(&self, core: &SessionCore) {
        let (loaded, total) = core.progress();
        self.emit(UploadEvent::Progress { loaded, total });
    }

    pub fn set_state(&self, core: &mut SessionCore, state: SessionState) {
        if core.state == state {
            return;
        }
        debug!(from = ?core.state, to = ?state, "session state changed");
        core.state = state;
        self.emit(UploadEvent::StateChanged { state });
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Installs a fresh token and returns the previous one.
    pub fn rotate_cancel(&self) -> CancellationToken {
        let mut guard = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, CancellationToken::new())
    }

    /// Installs a newly selected file. Chunk progress is forwarded to the
    /// event channel as it is recorded.
    pub fn load_file(
        &self,
        core: &mut SessionCore,
        source: Arc<dyn ByteSource>,
        layout: ChunkLayout,
        key: String,
    ) {
        let mut registry = ChunkRegistry::new(layout);
        let events = self.events();
        registry.set_observer(Box::new(move |p: ChunkProgress| {
            let _ = events.send(UploadEvent::ChunkProgress {
                index: p.index,
                loaded: p.loaded,
                length: p.length,
            });
            let _ = events.send(UploadEvent::Progress {
                loaded: p.total_loaded,
                total: p.total_size,
            });
        }));
        core.source = Some(source);
        core.key = key;
        core.registry = Some(registry);
        self.reset_upload(core);
        self.set_state(core, SessionState::Idle);
    }

    /// Returns the session to a pristine upload: no upload id, every chunk
    /// pending, no cached signatures, counters cleared.
    pub fn reset_upload(&self, core: &mut SessionCore) {
        if let Some(registry) = core.registry.as_mut() {
            registry.reset();
        }
        core.upload_id = None;
        core.retry_count = 0;
        core.start_fired = false;
        self.signatures.clear();
    }
}
