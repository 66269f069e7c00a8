//! The public upload handle.

use std::fmt;
use std::sync::Arc;

use mule_protocol::FileIdentity;
use mule_transfer::{ByteSource, validate_file};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::completion::{self, Finish};
use crate::config::UploaderConfig;
use crate::error::UploadError;
use crate::events::UploadEvent;
use crate::reconcile;
use crate::scheduler;
use crate::session::{SessionState, Shared};
use crate::signing::SigningService;
use crate::transport::Transport;

/// Result of offering a file to [`Uploader::select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Accepted,
    /// The select filter turned the file down.
    Declined,
}

/// How a call to [`Uploader::start`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed { key: String, upload_id: String },
    /// [`Uploader::cancel`] was called while the upload ran.
    Canceled,
}

/// Uploads one file at a time as an S3 multipart upload.
///
/// Cloning is cheap; every clone drives the same session, so one task can
/// run [`start`](Self::start) while another calls [`cancel`](Self::cancel).
#[derive(Clone)]
pub struct Uploader {
    shared: Arc<Shared>,
}

impl Uploader {
    pub fn new(
        config: UploaderConfig,
        transport: Arc<dyn Transport>,
        signer: Arc<dyn SigningService>,
    ) -> Result<Self, UploadError> {
        config.validate()?;
        let shared = Arc::new(Shared::new(config, transport, signer));
        shared.emit(UploadEvent::Initialized);
        info!(
            host = %shared.config.host(),
            workers = shared.config.num_workers,
            chunk_size = shared.config.chunk_size,
            "uploader initialized"
        );
        Ok(Self { shared })
    }

    /// Takes the event receiver. Returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<UploadEvent>> {
        self.shared.take_events()
    }

    /// Installs a filter consulted for every accepted file; returning
    /// `false` declines it.
    pub fn set_select_filter(&self, filter: impl Fn(&FileIdentity) -> bool + Send + Sync + 'static) {
        *self
            .shared
            .select_filter
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Box::new(filter));
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.core().state
    }

    /// `(loaded, total)` bytes of the selected file.
    pub fn progress(&self) -> (u64, u64) {
        self.shared.core().progress()
    }

    /// Object key of the selected file.
    pub fn key(&self) -> Option<String> {
        let core = self.shared.core();
        (!core.key.is_empty()).then(|| core.key.clone())
    }

    pub fn upload_id(&self) -> Option<String> {
        self.shared.core().upload_id.clone()
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Validates `source` and makes it the session's file.
    ///
    /// Rejections are returned as [`UploadError::Validation`] before any
    /// network activity.
    pub fn select(&self, source: Arc<dyn ByteSource>) -> Result<Selection, UploadError> {
        self.ensure_selectable()?;

        let identity = source.identity().clone();
        let config = &self.shared.config;
        let layout = validate_file(
            &identity,
            config.chunk_size,
            config.max_file_size,
            &config.accepted_extensions,
        )
        .map_err(UploadError::Validation)?;

        let accepted = self
            .shared
            .select_filter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_none_or(|filter| filter(&identity));
        if !accepted {
            debug!(file = %identity.name, "file declined by select filter");
            return Ok(Selection::Declined);
        }

        let key = object_key(config, &identity);
        let mut core = self.shared.core();
        if core.active_run.is_some() {
            return Err(UploadError::InvalidState {
                operation: "select a file",
                state: core.state,
            });
        }
        self.shared.load_file(&mut core, source, layout, key.clone());
        info!(
            file = %identity.name,
            size = identity.size,
            chunks = layout.chunk_count(),
            key = %key,
            "file selected"
        );
        Ok(Selection::Accepted)
    }

    fn ensure_selectable(&self) -> Result<(), UploadError> {
        let core = self.shared.core();
        let idle = matches!(core.state, SessionState::Idle | SessionState::Finished);
        if !idle || core.active_run.is_some() {
            return Err(UploadError::InvalidState {
                operation: "select a file",
                state: core.state,
            });
        }
        Ok(())
    }

    /// Selects `source` and, when `auto_start` is set, uploads it.
    ///
    /// Returns `None` when the file was declined or auto-start is off.
    pub async fn upload(
        &self,
        source: Arc<dyn ByteSource>,
    ) -> Result<Option<UploadOutcome>, UploadError> {
        if self.select(source)? == Selection::Declined {
            return Ok(None);
        }
        if !self.shared.config.auto_start {
            return Ok(None);
        }
        self.start(false).await.map(Some)
    }

    /// Continues a multipart upload from an earlier session.
    ///
    /// The selected file must be the one that upload was started for; the
    /// next [`start`](Self::start) lists its parts and uploads the rest.
    pub fn resume_from(
        &self,
        upload_id: impl Into<String>,
        key: Option<String>,
    ) -> Result<(), UploadError> {
        let mut core = self.shared.core();
        if core.state != SessionState::Idle || core.active_run.is_some() {
            return Err(UploadError::InvalidState {
                operation: "resume",
                state: core.state,
            });
        }
        if core.source.is_none() {
            return Err(UploadError::NoFileSelected);
        }
        self.shared.reset_upload(&mut core);
        let upload_id = upload_id.into();
        if let Some(key) = key {
            core.key = key;
        }
        info!(upload_id = %upload_id, key = %core.key, "resuming previous upload");
        core.upload_id = Some(upload_id);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    /// Runs the upload to the end: initiate or reconcile, upload every
    /// chunk, complete.
    ///
    /// `force` discards any known progress and starts every chunk over.
    /// Terminal errors are also sent as [`UploadEvent::Error`]; the session
    /// keeps its state so the caller can start again or cancel.
    pub async fn start(&self, force: bool) -> Result<UploadOutcome, UploadError> {
        let (run, cancel) = self.begin_run()?;
        let result = self.drive(force, &cancel).await;
        self.end_run(run);

        match result {
            Ok(outcome) => Ok(outcome),
            Err(UploadError::Cancelled) => {
                debug!(run, "upload run canceled");
                Ok(UploadOutcome::Canceled)
            }
            Err(err) => {
                error!(error = %err, "upload failed");
                self.shared.emit(UploadEvent::Error(err.info()));
                Err(err)
            }
        }
    }

    fn begin_run(&self) -> Result<(u64, CancellationToken), UploadError> {
        let mut core = self.shared.core();
        if core.active_run.is_some() {
            return Err(UploadError::InvalidState {
                operation: "start",
                state: core.state,
            });
        }
        if core.source.is_none() {
            return Err(UploadError::NoFileSelected);
        }
        match core.state {
            SessionState::Idle => self.shared.set_state(&mut core, SessionState::Initializing),
            SessionState::Initializing | SessionState::Uploading => {}
            state => {
                return Err(UploadError::InvalidState {
                    operation: "start",
                    state,
                });
            }
        }
        core.runs += 1;
        let run = core.runs;
        core.active_run = Some(run);
        Ok((run, self.shared.cancel_token()))
    }

    fn end_run(&self, run: u64) {
        let mut core = self.shared.core();
        if core.active_run == Some(run) {
            core.active_run = None;
        }
    }

    async fn drive(&self, mut force: bool, cancel: &CancellationToken) -> Result<UploadOutcome, UploadError> {
        let shared = &self.shared;
        loop {
            reconcile::prepare(shared, force, cancel).await?;
            self.begin_uploading(cancel)?;

            loop {
                scheduler::run(shared, cancel).await?;
                match completion::finish(shared, cancel).await? {
                    Finish::Completed { key, upload_id } => {
                        return Ok(UploadOutcome::Completed { key, upload_id });
                    }
                    Finish::Resume | Finish::Skipped => continue,
                    Finish::Restart => break,
                }
            }

            {
                let mut core = shared.core_live(cancel)?;
                shared.reset_upload(&mut core);
                shared.set_state(&mut core, SessionState::Initializing);
            }
            force = true;
        }
    }

    /// Moves the session to `Uploading` and reports where it stands.
    fn begin_uploading(&self, cancel: &CancellationToken) -> Result<(), UploadError> {
        let shared = &self.shared;
        let mut core = shared.core_live(cancel)?;
        if core.state == SessionState::Initializing {
            shared.set_state(&mut core, SessionState::Uploading);
        }
        if core.state != SessionState::Uploading {
            return Err(UploadError::InvalidState {
                operation: "upload chunks",
                state: core.state,
            });
        }
        if !core.start_fired {
            core.start_fired = true;
            let file = core.source()?.identity().clone();
            let total = core.progress().1;
            shared.emit(UploadEvent::Started { file });
            shared.emit(UploadEvent::Progress { loaded: 0, total });
        }
        shared.emit_progress(&core);
        Ok(())
    }

    /// Aborts every transfer and returns the session to `Idle` with no
    /// upload. The selected file stays selected.
    pub fn cancel(&self) {
        let shared = &self.shared;
        let mut core = shared.core();
        shared.rotate_cancel().cancel();

        let was = core.state;
        if was != SessionState::Idle {
            shared.set_state(&mut core, SessionState::Canceled);
        }
        shared.reset_upload(&mut core);
        core.active_run = None;
        shared.emit(UploadEvent::Progress { loaded: 0, total: 0 });
        shared.set_state(&mut core, SessionState::Idle);
        info!(from = ?was, "upload canceled");
    }
}

impl fmt::Debug for Uploader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.shared.core();
        f.debug_struct("Uploader")
            .field("state", &core.state)
            .field("key", &core.key)
            .field("upload_id", &core.upload_id)
            .finish_non_exhaustive()
    }
}

/// Fixed key, else `base_key` plus a random suffix, else the file name.
fn object_key(config: &UploaderConfig, file: &FileIdentity) -> String {
    if let Some(key) = config.key.as_deref().filter(|k| !k.is_empty()) {
        return key.to_string();
    }
    if let Some(base) = config.base_key.as_deref() {
        return format!("{base}{}", Uuid::new_v4().simple());
    }
    file.name.clone()
}
