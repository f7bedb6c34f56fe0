//! The three stage workers: fetch, encode, upload.
//!
//! Each worker is a single sequential loop over chunk indices 0..N, so
//! per-stage issuance order is strictly increasing by construction. The
//! stages overlap with each other through the slot buffer: fetch may be
//! pulling chunk i+2 while encode works on i+1 and upload ships i.
//!
//! Failure protocol: the failing worker announces its stage on a set-once
//! watch channel and marks its not-yet-produced output cells aborted.
//! Workers upstream of the failure cancel at their next await point;
//! workers downstream drain the units already materialized in the slot
//! buffer (keeping the persisted output a contiguous prefix) and halt when
//! they reach an aborted cell.

use crate::codec::ChunkCodec;
use crate::error::PipelineError;
use crate::pipeline::metrics::{Metrics, Stage, TimingLog};
use crate::pipeline::slots::SlotBuffer;
use crate::store::ChunkStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Set-once broadcast of the first stage to fail.
#[derive(Clone)]
pub(crate) struct FailureSignal {
    tx: Arc<watch::Sender<Option<Stage>>>,
}

impl FailureSignal {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(None).0),
        }
    }

    /// Record the failing stage. Later announcements are ignored, so the
    /// root cause wins.
    pub fn announce(&self, stage: Stage) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(stage);
                true
            } else {
                false
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Stage>> {
        self.tx.subscribe()
    }
}

/// A fatal error pinned to the stage and chunk where it occurred.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: Stage,
    pub chunk: u64,
    pub error: PipelineError,
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} stage failed at chunk {}: {}",
            self.stage, self.chunk, self.error
        )
    }
}

/// How a stage worker's loop ended.
#[derive(Debug)]
pub(crate) enum StageOutcome {
    /// All N units completed.
    Completed,
    /// Input ended early because an upstream stage failed; the contiguous
    /// prefix before the failure was fully processed.
    Halted,
    /// Stopped issuing new units after a failure at or below this stage.
    Cancelled,
    /// This stage is where the run failed.
    Failed(StageFailure),
}

/// Shared state handed to each stage worker.
#[derive(Clone)]
pub(crate) struct StageContext {
    pub slots: Arc<SlotBuffer>,
    pub metrics: Arc<Metrics>,
    pub timings: Arc<TimingLog>,
    pub signal: FailureSignal,
    pub epoch: Instant,
    pub num_chunks: u64,
}

/// Run `fut` unless a failure matching `cancels` is announced first.
/// Returns `None` when cancelled.
async fn until_failure<T>(
    rx: &mut watch::Receiver<Option<Stage>>,
    cancels: fn(Stage) -> bool,
    fut: impl Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        out = fut => Some(out),
        _ = rx.wait_for(move |v| matches!(v, Some(s) if cancels(*s))) => None,
    }
}

/// Mark the failure, abort downstream cells, and build the outcome.
fn fail(ctx: &StageContext, stage: Stage, chunk: u64, error: PipelineError) -> StageOutcome {
    match stage {
        Stage::Fetch => ctx.slots.abort_raw_from(chunk),
        Stage::Encode => ctx.slots.abort_encoded_from(chunk),
        Stage::Upload => {}
    }
    ctx.signal.announce(stage);
    ctx.metrics.add_failure();
    tracing::error!("{} stage failed at chunk {}: {}", stage, chunk, error);
    StageOutcome::Failed(StageFailure { stage, chunk, error })
}

/// Fetch stage: pull raw chunks from the store in strict index order.
pub(crate) async fn run_fetch_stage(ctx: StageContext, store: Arc<ChunkStore>) -> StageOutcome {
    let mut rx = ctx.signal.subscribe();
    // Any failure anywhere means no further fetches should be issued
    let cancels = |_: Stage| true;

    for index in 0..ctx.num_chunks {
        // Reserve before the network call so in-flight fetches count
        // against the occupancy bound
        match until_failure(&mut rx, cancels, ctx.slots.reserve_raw()).await {
            None => return StageOutcome::Cancelled,
            Some(Err(err)) => return fail(&ctx, Stage::Fetch, index, err),
            Some(Ok(())) => {}
        }

        let started = ctx.epoch.elapsed();
        let payload = match until_failure(&mut rx, cancels, store.get_chunk(index)).await {
            None => return StageOutcome::Cancelled,
            Some(Err(err)) => return fail(&ctx, Stage::Fetch, index, err),
            Some(Ok(payload)) => payload,
        };

        ctx.metrics.add_bytes_fetched(payload.len() as u64);
        if let Err(err) = ctx.slots.put_raw(index, payload) {
            return fail(&ctx, Stage::Fetch, index, err);
        }
        ctx.timings
            .record(index, Stage::Fetch, started, ctx.epoch.elapsed() - started);
        ctx.metrics.add_chunk_fetched();
        tracing::debug!("fetched chunk {}", index);
    }
    StageOutcome::Completed
}

/// Encode stage: drain raw cells in order, run the codec on a blocking
/// thread, fill encoded cells.
pub(crate) async fn run_encode_stage(
    ctx: StageContext,
    codec: Arc<dyn ChunkCodec>,
) -> StageOutcome {
    let mut rx = ctx.signal.subscribe();
    // Only a downstream (upload) failure cancels this stage; a fetch
    // failure is handled by draining up to the aborted cell
    let cancels = |s: Stage| s == Stage::Upload;

    for index in 0..ctx.num_chunks {
        let raw = match until_failure(&mut rx, cancels, ctx.slots.take_raw(index)).await {
            None => return StageOutcome::Cancelled,
            Some(Err(err)) => return fail(&ctx, Stage::Encode, index, err),
            Some(Ok(None)) => {
                ctx.slots.abort_encoded_from(index);
                return StageOutcome::Halted;
            }
            Some(Ok(Some(payload))) => payload,
        };

        match until_failure(&mut rx, cancels, ctx.slots.reserve_encoded()).await {
            None => return StageOutcome::Cancelled,
            Some(Err(err)) => return fail(&ctx, Stage::Encode, index, err),
            Some(Ok(())) => {}
        }

        let started = ctx.epoch.elapsed();
        let worker = codec.clone();
        let task = tokio::task::spawn_blocking(move || worker.encode(raw));
        let encoded = match until_failure(&mut rx, cancels, task).await {
            None => return StageOutcome::Cancelled,
            Some(Err(join_err)) => {
                return fail(
                    &ctx,
                    Stage::Encode,
                    index,
                    PipelineError::Transform {
                        chunk: index,
                        reason: format!("encode task panicked: {join_err}"),
                    },
                )
            }
            Some(Ok(Err(err))) => {
                return fail(
                    &ctx,
                    Stage::Encode,
                    index,
                    PipelineError::Transform {
                        chunk: index,
                        reason: err.to_string(),
                    },
                )
            }
            Some(Ok(Ok(bytes))) => bytes,
        };

        if let Err(err) = ctx.slots.put_encoded(index, encoded) {
            return fail(&ctx, Stage::Encode, index, err);
        }
        ctx.timings
            .record(index, Stage::Encode, started, ctx.epoch.elapsed() - started);
        ctx.metrics.add_chunk_encoded();
        tracing::debug!("encoded chunk {}", index);
    }
    StageOutcome::Completed
}

/// Upload stage: drain encoded cells in order and ship them to the store.
///
/// The last stage never cancels via the failure signal: an upstream
/// failure reaches it as an aborted cell after the drained prefix, and its
/// own failure ends the loop directly.
pub(crate) async fn run_upload_stage(ctx: StageContext, store: Arc<ChunkStore>) -> StageOutcome {
    for index in 0..ctx.num_chunks {
        let payload = match ctx.slots.take_encoded(index).await {
            Err(err) => return fail(&ctx, Stage::Upload, index, err),
            Ok(None) => return StageOutcome::Halted,
            Ok(Some(payload)) => payload,
        };

        let size = payload.len() as u64;
        let started = ctx.epoch.elapsed();
        if let Err(err) = store.put_chunk(index, payload).await {
            return fail(&ctx, Stage::Upload, index, err);
        }
        ctx.timings
            .record(index, Stage::Upload, started, ctx.epoch.elapsed() - started);
        ctx.metrics.add_bytes_uploaded(size);
        ctx.metrics.add_chunk_uploaded();
        tracing::debug!("uploaded chunk {}", index);
    }
    StageOutcome::Completed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failure_signal_keeps_first_announcement() {
        let signal = FailureSignal::new();
        let mut rx = signal.subscribe();
        signal.announce(Stage::Encode);
        signal.announce(Stage::Upload);
        let seen = rx.wait_for(|v| v.is_some()).await.unwrap();
        assert_eq!(*seen, Some(Stage::Encode));
    }

    #[tokio::test]
    async fn test_until_failure_cancels_blocked_future() {
        let signal = FailureSignal::new();
        let mut rx = signal.subscribe();
        signal.announce(Stage::Fetch);
        let outcome = until_failure(&mut rx, |_| true, std::future::pending::<()>()).await;
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_until_failure_ignores_non_matching_stage() {
        let signal = FailureSignal::new();
        let mut rx = signal.subscribe();
        signal.announce(Stage::Fetch);
        // An encode-level guard does not cancel on a fetch failure
        let outcome =
            until_failure(&mut rx, |s| s == Stage::Upload, std::future::ready(7)).await;
        assert_eq!(outcome, Some(7));
    }
}
