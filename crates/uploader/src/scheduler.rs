//! Bounded pool of concurrent chunk uploads.

use std::sync::Arc;

use mule_protocol::{SignatureKind, part_number};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::UploadError;
use crate::events::{Operation, UploadEvent};
use crate::retry::{self, RetryPolicy};
use crate::s3;
use crate::session::{SessionState, Shared};

/// How one slot of the pool ended.
#[derive(Debug)]
enum ChunkOutcome {
    Uploaded,
    /// Failed and waited out the retry delay; the chunk should be tried next.
    Retry(u32),
    /// Failed past the retry limit, or with a non-retryable error.
    Abandoned(UploadError),
    Cancelled,
}

/// Uploads chunks until the registry reports every chunk uploaded.
///
/// At most `num_workers` slots are occupied at once; a slot frees when its
/// chunk succeeds or when a failed chunk has waited out the retry delay.
pub(crate) async fn run(shared: &Arc<Shared>, cancel: &CancellationToken) -> Result<(), UploadError> {
    let workers = shared.config.num_workers.max(1);
    let mut slots: JoinSet<ChunkOutcome> = JoinSet::new();
    let mut preferred: Option<u32> = None;

    loop {
        while slots.len() < workers {
            let claimed = match claim(shared, cancel, preferred.take()) {
                Ok(claimed) => claimed,
                Err(err) => {
                    slots.shutdown().await;
                    return Err(err);
                }
            };
            let Some(index) = claimed else {
                break;
            };
            debug!(chunk = index, in_flight = slots.len() + 1, "starting chunk upload");
            slots.spawn(upload_chunk(Arc::clone(shared), index, cancel.clone()));
        }

        if slots.is_empty() {
            let done = shared.core_live(cancel)?.registry()?.all_uploaded();
            if done {
                return Ok(());
            }
            // Chunks are flagged as uploading outside this pool; look again later.
            retry::sleep(shared.config.poll_interval(), cancel).await?;
            continue;
        }

        let joined = tokio::select! {
            _ = cancel.cancelled() => None,
            joined = slots.join_next() => joined,
        };
        let Some(joined) = joined else {
            slots.shutdown().await;
            return Err(UploadError::Cancelled);
        };

        match joined {
            Ok(ChunkOutcome::Uploaded) => {}
            Ok(ChunkOutcome::Retry(index)) => preferred = Some(index),
            Ok(ChunkOutcome::Abandoned(err)) => {
                slots.shutdown().await;
                if let Ok(mut core) = shared.core_live(cancel)
                    && let Some(registry) = core.registry.as_mut()
                {
                    let reset = registry.abort_in_flight();
                    debug!(chunks = ?reset, "reset in-flight chunks after abandoning upload");
                    shared.emit_progress(&core);
                }
                return Err(err);
            }
            Ok(ChunkOutcome::Cancelled) => {
                slots.shutdown().await;
                return Err(UploadError::Cancelled);
            }
            Err(join_err) if join_err.is_panic() => std::panic::resume_unwind(join_err.into_panic()),
            Err(_) => {}
        }
    }
}

/// Picks the next eligible chunk and flags it as uploading, atomically.
fn claim(
    shared: &Shared,
    cancel: &CancellationToken,
    preferred: Option<u32>,
) -> Result<Option<u32>, UploadError> {
    let mut core = shared.core_live(cancel)?;
    if core.state != SessionState::Uploading {
        return Err(UploadError::InvalidState {
            operation: "upload chunks",
            state: core.state,
        });
    }
    let registry = core.registry_mut()?;
    let Some(index) = registry.next_eligible(preferred) else {
        return Ok(None);
    };
    registry.mark_uploading(index);
    Ok(Some(index))
}

async fn upload_chunk(shared: Arc<Shared>, index: u32, cancel: CancellationToken) -> ChunkOutcome {
    let err = match transfer(&shared, index, &cancel).await {
        Ok(etag) => return on_uploaded(&shared, index, etag, &cancel),
        Err(UploadError::Cancelled) => return ChunkOutcome::Cancelled,
        Err(err) => err,
    };

    let exhausted = {
        let Ok(mut core) = shared.core_live(&cancel) else {
            return ChunkOutcome::Cancelled;
        };
        if let Some(registry) = core.registry.as_mut() {
            registry.clear_uploading(index);
            registry.set_bytes_transferred(index, 0);
        }
        err.is_transient() && shared.retry.record_failure(&mut core)
    };

    if !err.is_transient() || exhausted {
        warn!(chunk = index, error = %err, "abandoning chunk upload");
        let err = if exhausted {
            UploadError::RetryLimitExceeded {
                operation: Operation::UploadChunk,
                chunk: Some(index),
                source: Box::new(err),
            }
        } else {
            err
        };
        return ChunkOutcome::Abandoned(err);
    }

    warn!(
        chunk = index,
        error = %err,
        delay_ms = shared.retry.delay().as_millis() as u64,
        "chunk upload failed; retrying"
    );
    match retry::sleep(shared.retry.delay(), &cancel).await {
        Ok(()) => ChunkOutcome::Retry(index),
        Err(_) => ChunkOutcome::Cancelled,
    }
}

fn on_uploaded(
    shared: &Arc<Shared>,
    index: u32,
    etag: Option<String>,
    cancel: &CancellationToken,
) -> ChunkOutcome {
    let params = {
        let Ok(mut core) = shared.core_live(cancel) else {
            return ChunkOutcome::Cancelled;
        };
        if core.state != SessionState::Uploading {
            return ChunkOutcome::Cancelled;
        }
        let Some(registry) = core.registry.as_mut() else {
            return ChunkOutcome::Cancelled;
        };
        let length = registry.chunk_len(index);
        registry.set_bytes_transferred(index, length);
        registry.mark_uploaded(index, etag);
        RetryPolicy::record_success(&mut core);
        core.signing_params(&shared.config)
    };

    shared.emit(UploadEvent::ChunkUploaded { index });
    debug!(chunk = index, "chunk uploaded");

    if let Ok(params) = params {
        let signer = Arc::clone(&shared.signer);
        let part = part_number(index);
        tokio::spawn(async move {
            if let Err(err) = signer.notify_chunk_uploaded(params, part).await {
                debug!(part, error = %err, "chunk notification failed");
            }
        });
    }
    ChunkOutcome::Uploaded
}

/// Sends one chunk, watching for stalls. Returns the part's ETag.
async fn transfer(
    shared: &Shared,
    index: u32,
    cancel: &CancellationToken,
) -> Result<Option<String>, UploadError> {
    let (source, range, params, upload_id) = {
        let core = shared.core_live(cancel)?;
        let upload_id = core.upload_id.clone().ok_or(UploadError::InvalidState {
            operation: "upload chunks",
            state: core.state,
        })?;
        (
            core.source()?,
            core.registry()?.chunk_range(index),
            core.signing_params(&shared.config)?,
            upload_id,
        )
    };
    let part = part_number(index);

    let signature = retry::cancellable(cancel, async {
        shared
            .signatures
            .fetch(&*shared.signer, SignatureKind::Chunk(part), params.clone())
            .await
            .map_err(UploadError::from)
    })
    .await?;
    let body = retry::cancellable(cancel, async {
        source.slice(range).await.map_err(UploadError::Source)
    })
    .await?;

    let request = s3::upload_part(&shared.config, &params, &upload_id, part, &signature, body);
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let send = shared.transport.send(request, Some(progress_tx));
    tokio::pin!(send);

    let period = shared.config.watchdog_interval();
    let stall_timeout = shared.config.stall_timeout();
    let mut watchdog = tokio::time::interval_at(Instant::now() + period, period);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_progress = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            result = &mut send => {
                let response = s3::expect_success(Operation::UploadChunk, result?)?;
                return Ok(response.header("ETag").map(str::to_string));
            }
            Some(sent) = progress_rx.recv() => {
                last_progress = Instant::now();
                let mut core = shared.core_live(cancel)?;
                if core.state == SessionState::Uploading
                    && let Some(registry) = core.registry.as_mut()
                {
                    registry.set_bytes_transferred(index, sent);
                }
            }
            _ = watchdog.tick() => {
                if last_progress.elapsed() > stall_timeout {
                    warn!(chunk = index, idle_ms = last_progress.elapsed().as_millis() as u64, "chunk upload stalled");
                    return Err(UploadError::Stalled { chunk: index });
                }
            }
        }
    }
}
