//! Completion handshake: verify parts against the backend, submit the
//! manifest, and sort out the ways completion can fail.

use mule_protocol::{ManifestEntry, S3ErrorCode, Signature, SignatureKind, xml};
use mule_transfer::ChunkRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::UploadError;
use crate::events::{Operation, UploadEvent};
use crate::reconcile::{self, ListMode};
use crate::retry::{self, RetryPolicy};
use crate::s3;
use crate::session::{SessionState, Shared};
use crate::signing::SigningParams;
use crate::transport::HttpResponse;

/// Where the session goes after a finish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Finish {
    Completed { key: String, upload_id: String },
    /// Parts are missing on the backend; upload them and finish again.
    Resume,
    /// The multipart upload is gone and the object was never created.
    Restart,
    /// Not every chunk is uploaded, or another finish is already running.
    Skipped,
}

/// How the backend answered the completion request.
#[derive(Debug)]
enum Answer {
    Success,
    TooSmall,
    NoSuchUpload,
    Other { status: Option<u16>, message: String },
}

/// Runs the finish sequence once the registry reports every chunk uploaded.
///
/// Moves the session to `Finishing` on entry, so a second caller gets
/// [`Finish::Skipped`]. On a terminal error the session returns to
/// `Uploading` and the error is handed back.
pub(crate) async fn finish(shared: &Shared, cancel: &CancellationToken) -> Result<Finish, UploadError> {
    {
        let mut core = shared.core_live(cancel)?;
        let ready = core.state == SessionState::Uploading
            && core.registry.as_ref().is_some_and(ChunkRegistry::all_uploaded);
        if !ready {
            return Ok(Finish::Skipped);
        }
        shared.set_state(&mut core, SessionState::Finishing);
        let total = core.progress().1;
        shared.emit(UploadEvent::Progress {
            loaded: total,
            total,
        });
    }

    match assemble(shared, cancel).await {
        Err(err) if !matches!(err, UploadError::Cancelled) => {
            if let Ok(mut core) = shared.core_live(cancel)
                && core.state == SessionState::Finishing
            {
                shared.set_state(&mut core, SessionState::Uploading);
            }
            Err(err)
        }
        other => other,
    }
}

async fn assemble(shared: &Shared, cancel: &CancellationToken) -> Result<Finish, UploadError> {
    let parts = reconcile::list_parts(shared, cancel, ListMode::Retry).await?;
    let (params, upload_id, expected) = {
        let core = shared.core_live(cancel)?;
        let upload_id = core.upload_id.clone().ok_or(UploadError::InvalidState {
            operation: "finish",
            state: core.state,
        })?;
        (
            core.signing_params(&shared.config)?,
            upload_id,
            core.registry()?.chunk_count(),
        )
    };

    if parts.len() as u32 != expected {
        warn!(
            listed = parts.len(),
            expected, "backend is missing parts; resuming upload"
        );
        return resume_uploading(shared, cancel, &parts);
    }

    let signature = shared
        .retry
        .run(shared, cancel, Operation::Sign, || {
            finish_signature(shared, params.clone())
        })
        .await?;

    let manifest: Vec<ManifestEntry> = parts.iter().map(ManifestEntry::from).collect();
    let request = s3::complete(
        &shared.config,
        &params,
        &upload_id,
        &signature,
        xml::complete_manifest(&manifest),
    );
    debug!(parts = manifest.len(), upload_id = %upload_id, "submitting completion manifest");
    let sent = retry::cancellable(cancel, async {
        shared
            .transport
            .send(request, None)
            .await
            .map_err(UploadError::from)
    })
    .await;

    match classify(sent)? {
        Answer::Success => finished(shared, cancel, params, upload_id),
        Answer::TooSmall => {
            warn!(upload_id = %upload_id, "backend rejected a part as too small; re-listing");
            let parts = reconcile::list_parts(shared, cancel, ListMode::Retry).await?;
            resume_uploading(shared, cancel, &parts)
        }
        Answer::NoSuchUpload => {
            if object_exists(shared, cancel, &params.key).await? {
                info!(key = %params.key, "upload already assembled by an earlier attempt");
                finished(shared, cancel, params, upload_id)
            } else {
                warn!(upload_id = %upload_id, "multipart upload vanished; restarting");
                Ok(Finish::Restart)
            }
        }
        Answer::Other { status, message } => {
            if object_exists(shared, cancel, &params.key).await? {
                info!(key = %params.key, "object exists despite completion error");
                finished(shared, cancel, params, upload_id)
            } else {
                Err(UploadError::CompletionFailed { status, message })
            }
        }
    }
}

async fn finish_signature(shared: &Shared, params: SigningParams) -> Result<Signature, UploadError> {
    Ok(shared
        .signatures
        .fetch(&*shared.signer, SignatureKind::Finish, params)
        .await?)
}

fn classify(sent: Result<HttpResponse, UploadError>) -> Result<Answer, UploadError> {
    let response = match sent {
        Ok(response) => response,
        Err(UploadError::Cancelled) => return Err(UploadError::Cancelled),
        Err(err) => {
            return Ok(Answer::Other {
                status: None,
                message: err.to_string(),
            });
        }
    };

    let code = xml::parse_error(&response.body);
    if response.is_success() && code.is_none() {
        return Ok(Answer::Success);
    }
    Ok(match code {
        Some(S3ErrorCode::EntityTooSmall) => Answer::TooSmall,
        Some(S3ErrorCode::NoSuchUpload) => Answer::NoSuchUpload,
        None if response.status == 404 => Answer::NoSuchUpload,
        Some(S3ErrorCode::Other(code)) => Answer::Other {
            status: Some(response.status),
            message: code,
        },
        None => Answer::Other {
            status: Some(response.status),
            message: response.text().into_owned(),
        },
    })
}

/// Checks for the assembled object with an unsigned `HEAD`. Any failure
/// counts as absent.
async fn object_exists(
    shared: &Shared,
    cancel: &CancellationToken,
    key: &str,
) -> Result<bool, UploadError> {
    let request = s3::head(&shared.config, key);
    let response = retry::cancellable(cancel, async {
        shared
            .transport
            .send(request, None)
            .await
            .map_err(UploadError::from)
    })
    .await;
    match response {
        Ok(response) => {
            debug!(key, status = response.status, "probed object");
            Ok(response.is_success())
        }
        Err(UploadError::Cancelled) => Err(UploadError::Cancelled),
        Err(err) => {
            debug!(key, error = %err, "object probe failed");
            Ok(false)
        }
    }
}

fn resume_uploading(
    shared: &Shared,
    cancel: &CancellationToken,
    parts: &[mule_protocol::PartInfo],
) -> Result<Finish, UploadError> {
    reconcile::apply_listing(shared, cancel, parts)?;
    let mut core = shared.core_live(cancel)?;
    shared.set_state(&mut core, SessionState::Uploading);
    shared.emit_progress(&core);
    Ok(Finish::Resume)
}

fn finished(
    shared: &Shared,
    cancel: &CancellationToken,
    params: SigningParams,
    upload_id: String,
) -> Result<Finish, UploadError> {
    let key = params.key.clone();
    {
        let mut core = shared.core_live(cancel)?;
        shared.set_state(&mut core, SessionState::Finished);
        RetryPolicy::record_success(&mut core);
        let total = core.progress().1;
        shared.emit(UploadEvent::Progress {
            loaded: total,
            total,
        });
    }

    let signer = std::sync::Arc::clone(&shared.signer);
    tokio::spawn(async move {
        if let Err(err) = signer.notify_upload_finished(params).await {
            debug!(error = %err, "upload-finished notification failed");
        }
    });

    shared.emit(UploadEvent::Completed {
        key: key.clone(),
        upload_id: upload_id.clone(),
    });
    info!(key = %key, upload_id = %upload_id, "upload finished");
    Ok(Finish::Completed { key, upload_id })
}
