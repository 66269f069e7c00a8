//! Brings local chunk state in line with the backend before uploading.
//!
//! Part numbers from the backend are translated to chunk indices here and
//! in the completion step, nowhere else.

use std::collections::BTreeSet;

use mule_protocol::{InitGrant, PartInfo, PartsPage, Signature, SignatureKind, chunk_index, xml};
use mule_transfer::{ChunkLayout, ConfirmedChunk};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::UploadError;
use crate::events::Operation;
use crate::retry;
use crate::s3;
use crate::session::Shared;
use crate::signing::SigningParams;
use crate::transport::HttpRequest;

/// Drops parts that do not belong to a chunk of `layout` or whose size
/// differs from the chunk's expected length. The result is sorted by part
/// number without duplicates.
pub(crate) fn validate_parts(layout: &ChunkLayout, parts: Vec<PartInfo>) -> Vec<PartInfo> {
    let mut kept: Vec<PartInfo> = parts
        .into_iter()
        .filter(|part| {
            let Some(index) = chunk_index(part.part_number).filter(|&i| i < layout.chunk_count())
            else {
                warn!(part = part.part_number, "ignoring part outside the file");
                return false;
            };
            let expected = layout.chunk_len(index);
            if part.size != expected {
                warn!(
                    part = part.part_number,
                    size = part.size,
                    expected,
                    "ignoring part with unexpected size"
                );
                return false;
            }
            true
        })
        .collect();
    kept.sort_by_key(|part| part.part_number);
    kept.dedup_by_key(|part| part.part_number);
    kept
}

pub(crate) fn confirmed(parts: &[PartInfo]) -> Vec<ConfirmedChunk> {
    parts
        .iter()
        .filter_map(|part| {
            Some(ConfirmedChunk {
                index: chunk_index(part.part_number)?,
                etag: Some(part.etag.clone()),
            })
        })
        .collect()
}

/// How a listing reacts to failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListMode {
    /// One attempt; the caller decides what a failure means.
    Once,
    /// Retried against the shared counter.
    Retry,
}

/// Lists every part of the current upload, following continuation markers,
/// and returns the ones that match the chunk layout.
pub(crate) async fn list_parts(
    shared: &Shared,
    cancel: &CancellationToken,
    mode: ListMode,
) -> Result<Vec<PartInfo>, UploadError> {
    let (params, upload_id, layout) = {
        let core = shared.core_live(cancel)?;
        let upload_id = core.upload_id.clone().ok_or(UploadError::InvalidState {
            operation: "list parts",
            state: core.state,
        })?;
        (
            core.signing_params(&shared.config)?,
            upload_id,
            *core.registry()?.layout(),
        )
    };

    let signature = match mode {
        ListMode::Once => {
            retry::cancellable(cancel, list_signature(shared, params.clone())).await?
        }
        ListMode::Retry => {
            shared
                .retry
                .run(shared, cancel, Operation::Sign, || {
                    list_signature(shared, params.clone())
                })
                .await?
        }
    };

    let mut parts = Vec::new();
    let mut marker: Option<String> = None;
    loop {
        let request = s3::list_parts(
            &shared.config,
            &params,
            &upload_id,
            marker.as_deref(),
            &signature,
        );
        let page = match mode {
            ListMode::Once => retry::cancellable(cancel, fetch_page(shared, request)).await?,
            ListMode::Retry => {
                shared
                    .retry
                    .run(shared, cancel, Operation::ListParts, || {
                        fetch_page(shared, request.clone())
                    })
                    .await?
            }
        };
        debug!(
            parts = page.parts.len(),
            truncated = page.is_truncated,
            "listed a page of parts"
        );
        parts.extend(page.parts);

        if !page.is_truncated {
            break;
        }
        match page.next_marker {
            Some(next) if marker.as_deref() != Some(next.as_str()) => marker = Some(next),
            _ => {
                warn!("truncated part listing without a usable marker; stopping");
                break;
            }
        }
    }

    Ok(validate_parts(&layout, parts))
}

async fn list_signature(shared: &Shared, params: SigningParams) -> Result<Signature, UploadError> {
    Ok(shared
        .signatures
        .fetch(&*shared.signer, SignatureKind::List, params)
        .await?)
}

async fn fetch_page(shared: &Shared, request: HttpRequest) -> Result<PartsPage, UploadError> {
    let response = shared.transport.send(request, None).await?;
    let response = s3::expect_success(Operation::ListParts, response)?;
    Ok(xml::parse_parts_page(&response.body)?)
}

/// Applies a validated listing to the registry.
pub(crate) fn apply_listing(
    shared: &Shared,
    cancel: &CancellationToken,
    parts: &[PartInfo],
) -> Result<(), UploadError> {
    let mut core = shared.core_live(cancel)?;
    let registry = core.registry_mut()?;
    registry.reconcile(&confirmed(parts));
    debug!(
        confirmed = parts.len(),
        chunks = registry.chunk_count(),
        "reconciled chunks with the backend"
    );
    Ok(())
}

/// Gets the session ready for the scheduler: initiates a new multipart
/// upload or reconciles the known one, then primes the signature cache.
pub(crate) async fn prepare(
    shared: &Shared,
    force: bool,
    cancel: &CancellationToken,
) -> Result<(), UploadError> {
    let (known, key) = {
        let core = shared.core_live(cancel)?;
        (core.upload_id.clone(), core.key.clone())
    };

    match known {
        None => {
            if initiate(shared, force, cancel).await? {
                // An adopted upload may have been aborted or expired since.
                resume_or_restart(shared, cancel, Some(key)).await?;
            }
        }
        Some(upload_id) if force => {
            let mut core = shared.core_live(cancel)?;
            core.registry_mut()?.reset();
            info!(upload_id = %upload_id, "forced restart; every chunk pending");
        }
        Some(_) => resume_or_restart(shared, cancel, None).await?,
    }

    prime_signatures(shared, cancel).await
}

/// Reconciles the known upload with its part listing. If the listing fails
/// the upload is dropped for a forced fresh one under `fresh_key`, or under
/// the current key when none is given.
async fn resume_or_restart(
    shared: &Shared,
    cancel: &CancellationToken,
    fresh_key: Option<String>,
) -> Result<(), UploadError> {
    match list_parts(shared, cancel, ListMode::Once).await {
        Ok(parts) => {
            apply_listing(shared, cancel, &parts)?;
            let core = shared.core_live(cancel)?;
            info!(
                upload_id = core.upload_id.as_deref().unwrap_or_default(),
                parts = parts.len(),
                "resuming upload"
            );
            Ok(())
        }
        Err(UploadError::Cancelled) => Err(UploadError::Cancelled),
        Err(err) => {
            {
                let mut core = shared.core_live(cancel)?;
                warn!(
                    upload_id = core.upload_id.as_deref().unwrap_or_default(),
                    error = %err,
                    "listing parts failed; starting over"
                );
                shared.reset_upload(&mut core);
                if let Some(key) = fresh_key {
                    core.key = key;
                }
            }
            initiate(shared, true, cancel).await?;
            Ok(())
        }
    }
}

/// Fetches every signature of the upload in one round trip.
async fn prime_signatures(shared: &Shared, cancel: &CancellationToken) -> Result<(), UploadError> {
    let params = shared.core_live(cancel)?.signing_params(&shared.config)?;
    let bundle = shared
        .retry
        .run(shared, cancel, Operation::Sign, || {
            let params = params.clone();
            async move { shared.signer.sign_all(params).await.map_err(UploadError::from) }
        })
        .await?;
    debug!(chunks = bundle.chunks.len(), "signature cache primed");
    shared.signatures.prime(bundle);
    Ok(())
}

/// Starts a multipart upload, or adopts the unfinished one the signing
/// service reports for this file. Returns `true` when an upload was adopted.
async fn initiate(
    shared: &Shared,
    force: bool,
    cancel: &CancellationToken,
) -> Result<bool, UploadError> {
    let (params, chunk_count) = {
        let core = shared.core_live(cancel)?;
        (
            core.signing_params(&shared.config)?,
            core.registry()?.chunk_count(),
        )
    };

    let mut grant = request_grant(shared, cancel, &params, force).await?;

    if !force && let Some(hint) = grant.resume.take() {
        let listed: BTreeSet<u32> = hint
            .parts
            .iter()
            .filter_map(|&part| chunk_index(part))
            .filter(|&index| index < chunk_count)
            .collect();

        if listed.len() as u32 == chunk_count {
            // Every part is already there, yet the upload was never finished.
            info!(upload_id = %hint.upload_id, "previous upload has every part; starting a new one");
            grant = request_grant(shared, cancel, &params, true).await?;
        } else {
            let mut core = shared.core_live(cancel)?;
            core.key = hint.key.clone();
            core.upload_id = Some(hint.upload_id.clone());
            let confirmed: Vec<ConfirmedChunk> = listed
                .iter()
                .map(|&index| ConfirmedChunk { index, etag: None })
                .collect();
            core.registry_mut()?.reconcile(&confirmed);
            info!(
                upload_id = %hint.upload_id,
                key = %hint.key,
                parts = confirmed.len(),
                "adopting unfinished upload"
            );
            return Ok(true);
        }
    }

    let signature = grant.signature;
    let upload_id = shared
        .retry
        .run(shared, cancel, Operation::Initiate, || {
            let request = s3::initiate(&shared.config, &params, &signature);
            post_initiate(shared, request)
        })
        .await?;

    let mut core = shared.core_live(cancel)?;
    core.upload_id = Some(upload_id.clone());
    core.registry_mut()?.reset();
    info!(upload_id = %upload_id, key = %core.key, "multipart upload initiated");
    Ok(false)
}

async fn post_initiate(shared: &Shared, request: HttpRequest) -> Result<String, UploadError> {
    let response = shared.transport.send(request, None).await?;
    let response = s3::expect_success(Operation::Initiate, response)?;
    Ok(xml::parse_upload_id(&response.body)?)
}

async fn request_grant(
    shared: &Shared,
    cancel: &CancellationToken,
    params: &SigningParams,
    force: bool,
) -> Result<InitGrant, UploadError> {
    shared
        .retry
        .run(shared, cancel, Operation::Sign, || {
            let params = params.clone();
            async move {
                shared
                    .signer
                    .initiate(params, force)
                    .await
                    .map_err(UploadError::from)
            }
        })
        .await
}
