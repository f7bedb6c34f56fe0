//! Run orchestration: spawns the three stage workers, supervises the
//! failure protocol, and aggregates the final report.

use crate::codec::ChunkCodec;
use crate::config::Config;
use crate::error::PipelineError;
use crate::pipeline::metrics::{Metrics, MetricsReporter, Stage, TimingLog};
use crate::pipeline::slots::SlotBuffer;
use crate::pipeline::workers::{
    run_encode_stage, run_fetch_stage, run_upload_stage, FailureSignal, StageContext,
    StageFailure, StageOutcome,
};
use crate::store::ChunkStore;
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinError;

/// Lifecycle of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Running => write!(f, "running"),
            RunState::Completed => write!(f, "completed"),
            RunState::Failed => write!(f, "failed"),
        }
    }
}

/// The first stage failure of a run, flattened for the report.
#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub stage: Stage,
    pub chunk: u64,
    pub message: String,
}

impl From<StageFailure> for RunFailure {
    fn from(failure: StageFailure) -> Self {
        Self {
            stage: failure.stage,
            chunk: failure.chunk,
            message: failure.error.to_string(),
        }
    }
}

/// Final accounting for one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub state: RunState,
    pub total_chunks: u64,
    pub chunks_fetched: u64,
    pub chunks_encoded: u64,
    pub chunks_uploaded: u64,
    pub bytes_fetched: u64,
    pub bytes_uploaded: u64,
    pub fetch_secs: f64,
    pub encode_secs: f64,
    pub upload_secs: f64,
    pub wall_secs: f64,
    pub peak_resident_cells: usize,
    pub peak_resident_bytes: u64,
    pub failure: Option<RunFailure>,
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Run {}: {}/{} chunks uploaded in {:.2}s",
            self.state, self.chunks_uploaded, self.total_chunks, self.wall_secs
        )?;
        writeln!(
            f,
            "  fetch:  {} chunks, {:.2}s busy, {:.2} MB",
            self.chunks_fetched,
            self.fetch_secs,
            self.bytes_fetched as f64 / (1024.0 * 1024.0)
        )?;
        writeln!(
            f,
            "  encode: {} chunks, {:.2}s busy",
            self.chunks_encoded, self.encode_secs
        )?;
        writeln!(
            f,
            "  upload: {} chunks, {:.2}s busy, {:.2} MB",
            self.chunks_uploaded,
            self.upload_secs,
            self.bytes_uploaded as f64 / (1024.0 * 1024.0)
        )?;
        write!(
            f,
            "  peak resident: {} cells, {:.2} MB",
            self.peak_resident_cells,
            self.peak_resident_bytes as f64 / (1024.0 * 1024.0)
        )?;
        if let Some(failure) = &self.failure {
            write!(
                f,
                "\n  failure: {} stage at chunk {}: {}",
                failure.stage, failure.chunk, failure.message
            )?;
        }
        Ok(())
    }
}

/// Drives one run of the fetch/encode/upload pipeline.
pub struct PipelineRunner {
    config: Config,
    store: Arc<ChunkStore>,
    codec: Arc<dyn ChunkCodec>,
    state: RunState,
    timings: Arc<TimingLog>,
}

impl PipelineRunner {
    pub fn new(config: Config, store: Arc<ChunkStore>, codec: Arc<dyn ChunkCodec>) -> Self {
        Self {
            config,
            store,
            codec,
            state: RunState::Idle,
            timings: TimingLog::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// The per-chunk timing log, populated by `run`.
    pub fn timings(&self) -> Arc<TimingLog> {
        self.timings.clone()
    }

    /// Run the pipeline to completion or first failure.
    ///
    /// A stage failure is reported through `RunReport::failure` with the
    /// run state set to `Failed`; `Err` is reserved for setup problems
    /// such as an unwritable timing log path.
    pub async fn run(&mut self) -> Result<RunReport> {
        let num_chunks = self.config.dataset.num_chunks;
        let pipeline = &self.config.pipeline;
        self.state = RunState::Running;
        tracing::info!(
            "Starting pipeline: {} chunks, codec {}, lookahead {}+{}",
            num_chunks,
            self.codec.name(),
            pipeline.raw_capacity,
            pipeline.encoded_capacity,
        );

        let slots = Arc::new(SlotBuffer::new(
            num_chunks as usize,
            pipeline.raw_capacity,
            pipeline.encoded_capacity,
        ));
        let metrics = Metrics::new();
        let timings = self.timings.clone();
        let signal = FailureSignal::new();
        let ctx = StageContext {
            slots: slots.clone(),
            metrics: metrics.clone(),
            timings: timings.clone(),
            signal: signal.clone(),
            epoch: Instant::now(),
            num_chunks,
        };

        let reporter = if pipeline.enable_metrics {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
            let reporter =
                MetricsReporter::new(metrics.clone(), pipeline.metrics_interval_secs, num_chunks);
            Some((shutdown_tx, tokio::spawn(reporter.run(shutdown_rx))))
        } else {
            None
        };

        let fetch = tokio::spawn(run_fetch_stage(ctx.clone(), self.store.clone()));
        let encode = tokio::spawn(run_encode_stage(ctx.clone(), self.codec.clone()));
        let upload = tokio::spawn(run_upload_stage(ctx.clone(), self.store.clone()));

        let (fetch_out, encode_out, upload_out) = tokio::join!(fetch, encode, upload);
        let outcomes = [
            resolve(Stage::Fetch, fetch_out, &signal),
            resolve(Stage::Encode, encode_out, &signal),
            resolve(Stage::Upload, upload_out, &signal),
        ];

        if let Some((shutdown_tx, handle)) = reporter {
            let _ = shutdown_tx.send(()).await;
            let _ = handle.await;
        }

        let failure = root_cause(outcomes, &signal);
        self.state = if failure.is_none() {
            RunState::Completed
        } else {
            RunState::Failed
        };

        if let Some(path) = &pipeline.timings_output_path {
            timings.save_to_file(path)?;
        }

        let snapshot = metrics.snapshot();
        let report = RunReport {
            state: self.state,
            total_chunks: num_chunks,
            chunks_fetched: snapshot.chunks_fetched,
            chunks_encoded: snapshot.chunks_encoded,
            chunks_uploaded: snapshot.chunks_uploaded,
            bytes_fetched: snapshot.bytes_fetched,
            bytes_uploaded: snapshot.bytes_uploaded,
            fetch_secs: timings.stage_total(Stage::Fetch).as_secs_f64(),
            encode_secs: timings.stage_total(Stage::Encode).as_secs_f64(),
            upload_secs: timings.stage_total(Stage::Upload).as_secs_f64(),
            wall_secs: snapshot.elapsed.as_secs_f64(),
            peak_resident_cells: slots.peak_cells(),
            peak_resident_bytes: slots.peak_bytes(),
            failure,
        };
        tracing::info!("{}", report);
        Ok(report)
    }
}

/// Turn a joined worker result into its outcome, synthesizing a failure
/// for a panicked worker so the run still terminates with a cause.
fn resolve(
    stage: Stage,
    joined: Result<StageOutcome, JoinError>,
    signal: &FailureSignal,
) -> StageOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(err) => {
            signal.announce(stage);
            StageOutcome::Failed(StageFailure {
                stage,
                chunk: 0,
                error: PipelineError::SlotProtocol(format!("{stage} worker panicked: {err}")),
            })
        }
    }
}

/// Pick the failure that started the collapse: the stage the set-once
/// signal recorded first. Halted and cancelled outcomes are effects, not
/// causes.
fn root_cause(outcomes: [StageOutcome; 3], signal: &FailureSignal) -> Option<RunFailure> {
    let announced = *signal.subscribe().borrow();
    let mut failures: Vec<StageFailure> = outcomes
        .into_iter()
        .filter_map(|outcome| match outcome {
            StageOutcome::Failed(failure) => Some(failure),
            _ => None,
        })
        .collect();
    if failures.is_empty() {
        return None;
    }
    let position = announced
        .and_then(|stage| failures.iter().position(|f| f.stage == stage))
        .unwrap_or(0);
    Some(failures.swap_remove(position).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(stage: Stage, chunk: u64) -> StageOutcome {
        StageOutcome::Failed(StageFailure {
            stage,
            chunk,
            error: PipelineError::Cancelled,
        })
    }

    #[test]
    fn test_root_cause_prefers_announced_stage() {
        let signal = FailureSignal::new();
        signal.announce(Stage::Upload);
        let outcomes = [
            failure(Stage::Fetch, 4),
            StageOutcome::Cancelled,
            failure(Stage::Upload, 1),
        ];
        let cause = root_cause(outcomes, &signal).unwrap();
        assert_eq!(cause.stage, Stage::Upload);
        assert_eq!(cause.chunk, 1);
    }

    #[test]
    fn test_root_cause_none_when_all_completed() {
        let signal = FailureSignal::new();
        let outcomes = [
            StageOutcome::Completed,
            StageOutcome::Completed,
            StageOutcome::Completed,
        ];
        assert!(root_cause(outcomes, &signal).is_none());
    }

    #[test]
    fn test_report_display_mentions_failure() {
        let report = RunReport {
            state: RunState::Failed,
            total_chunks: 5,
            chunks_fetched: 2,
            chunks_encoded: 2,
            chunks_uploaded: 2,
            bytes_fetched: 2048,
            bytes_uploaded: 1024,
            fetch_secs: 0.1,
            encode_secs: 0.05,
            upload_secs: 0.08,
            wall_secs: 0.2,
            peak_resident_cells: 3,
            peak_resident_bytes: 3072,
            failure: Some(RunFailure {
                stage: Stage::Fetch,
                chunk: 2,
                message: "chunk key not found in store: sample.txt-chunk-2".to_string(),
            }),
        };
        let text = format!("{}", report);
        assert!(text.contains("Run failed"));
        assert!(text.contains("fetch stage at chunk 2"));
    }
}
